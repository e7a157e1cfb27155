//! Stand-in for platforms without a shared-memory capture backend.

use std::time::Duration;

use dbgscope_types::SourceType;

use crate::error::{CaptureError, Result};

pub(super) fn has_global_rights() -> bool {
    false
}

pub(super) struct SharedBuffer;

impl SharedBuffer {
    pub(super) fn create(_name: &str) -> Result<Self> {
        Err(CaptureError::Unsupported(SourceType::System))
    }

    pub(super) fn open(_name: &str) -> Result<Self> {
        Err(CaptureError::Unsupported(SourceType::System))
    }

    pub(super) fn bytes(&self) -> &[u8] {
        &[]
    }

    pub(super) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut []
    }
}

pub(super) struct NamedEvent;

impl NamedEvent {
    pub(super) fn create(_name: &str) -> Result<Self> {
        Err(CaptureError::Unsupported(SourceType::System))
    }

    pub(super) fn open(_name: &str) -> Result<Self> {
        Err(CaptureError::Unsupported(SourceType::System))
    }

    pub(super) fn set(&self) -> Result<()> {
        Ok(())
    }

    pub(super) fn wait(&self, _timeout: Duration) -> Result<bool> {
        Ok(false)
    }
}
