//! Container handle: an opened media source and its probed metadata.
//!
//! The native handle is shared: a [`ContainerLease`] keeps it open after the
//! `Container` itself is gone, for threads still holding decoders from it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BackendError, ContainerHandle, ContainerInfo, InitializedBackend, StreamDecoder};
use crate::packet::RawPacket;
use crate::stream::StreamDescriptor;
use crate::timestamp;

/// Result of probing a container
#[derive(Debug, Clone)]
pub struct Probe {
    /// Seconds
    pub duration: f64,
    /// Seconds
    pub start_time: f64,
    pub info: ContainerInfo,
    /// One descriptor per stream, in index order
    pub streams: Vec<StreamDescriptor>,
}

type SharedHandle = Arc<Mutex<Box<dyn ContainerHandle>>>;

pub struct Container {
    handle: SharedHandle,
    locator: String,
    info: ContainerInfo,
}

impl Container {
    pub fn open(backend: &InitializedBackend, locator: &str) -> Result<Self, BackendError> {
        let handle = backend.backend().open_container(locator)?;
        let info = handle.info();

        tracing::info!(
            "Opened {:?}: {} streams, {:.3}s",
            locator,
            info.stream_count,
            timestamp::from_backend(info.duration)
        );

        Ok(Self {
            handle: Arc::new(Mutex::new(handle)),
            locator: locator.to_string(),
            info,
        })
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        timestamp::from_backend(self.info.duration)
    }

    /// Keep the native container open for as long as the lease lives
    pub fn lease(&self) -> ContainerLease {
        ContainerLease {
            _handle: Arc::clone(&self.handle),
        }
    }

    /// Describe every stream. A stream the backend cannot describe is
    /// reported as `Other`.
    pub fn probe(&self) -> Probe {
        let handle = self.handle.lock();
        let streams = (0..self.info.stream_count)
            .map(|index| match handle.stream_info(index) {
                Ok(info) => StreamDescriptor::from(&info),
                Err(e) => {
                    tracing::warn!("No info for stream {}: {}", index, e);
                    StreamDescriptor::Other
                }
            })
            .collect();

        Probe {
            duration: self.duration(),
            start_time: timestamp::from_backend(self.info.start_time),
            info: self.info.clone(),
            streams,
        }
    }

    pub fn open_stream(&mut self, index: usize) -> Result<Box<dyn StreamDecoder>, BackendError> {
        self.handle.lock().open_stream(index)
    }

    /// Next packet in file order, `Ok(None)` at end of input
    pub fn read_packet(&mut self) -> Result<Option<RawPacket>, BackendError> {
        Ok(self.handle.lock().read_packet()?.map(RawPacket::from))
    }

    /// Reposition to `target` seconds
    pub fn seek(&mut self, target: f64) -> Result<(), BackendError> {
        self.handle.lock().seek(timestamp::to_backend(target))
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handle) > 1 {
            tracing::debug!("Releasing container {:?}, still leased", self.locator);
        } else {
            tracing::debug!("Closing container {:?}", self.locator);
        }
    }
}

/// Shared ownership of an open container's native handle
pub struct ContainerLease {
    _handle: SharedHandle,
}
