//! Ownership of an open capture device

use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use super::backend::{DeviceBackend, DeviceCapabilities};
use super::v4l2::V4l2Backend;
use crate::error::{CaptureError, Result};

/// An open device and the capabilities it reported at open time.
///
/// Closing drops the backend, which releases the descriptor.
pub struct DeviceHandle<B: DeviceBackend = V4l2Backend> {
    path: PathBuf,
    backend: Option<B>,
    capabilities: DeviceCapabilities,
}

impl DeviceHandle<V4l2Backend> {
    /// Open a V4L2 device node after checking it is a character device.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| classify_open_error(path, e))?;
        if !meta.file_type().is_char_device() {
            return Err(CaptureError::NotACharacterDevice(path.to_path_buf()));
        }

        let backend = V4l2Backend::open(path).map_err(|e| classify_open_error(path, e))?;
        Self::with_backend(path, backend)
    }
}

impl<B: DeviceBackend> DeviceHandle<B> {
    /// Wrap an already opened backend and validate its capabilities.
    pub fn with_backend(path: impl Into<PathBuf>, backend: B) -> Result<Self> {
        let path = path.into();
        let capabilities = backend.query_capabilities()?;

        if !capabilities.can_capture {
            return Err(CaptureError::NotACaptureDevice(path));
        }
        if !capabilities.can_stream {
            return Err(CaptureError::StreamingUnsupported(path));
        }

        info!(
            "Opened {}: {} ({}, {})",
            path.display(),
            capabilities.card,
            capabilities.driver,
            capabilities.bus
        );

        Ok(Self {
            path,
            backend: Some(backend),
            capabilities,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend(&self) -> Result<&B> {
        self.backend.as_ref().ok_or(CaptureError::DeviceClosed)
    }

    pub fn backend_mut(&mut self) -> Result<&mut B> {
        self.backend.as_mut().ok_or(CaptureError::DeviceClosed)
    }

    /// Release the descriptor. Safe to call more than once.
    pub fn close(&mut self) {
        if self.backend.take().is_some() {
            debug!("Closed {}", self.path.display());
        }
    }
}

fn classify_open_error(path: &Path, err: io::Error) -> CaptureError {
    match err.kind() {
        io::ErrorKind::NotFound => CaptureError::DeviceNotFound(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied(path.to_path_buf()),
        _ => CaptureError::Io(err),
    }
}
