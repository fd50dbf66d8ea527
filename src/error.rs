// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Error as IoError;
use std::num::TryFromIntError;

use thiserror::Error;

use crate::handle::ProcessId;
use crate::handle::ResourceHandle;
use crate::resource::ResourceKind;

/// An error generated while using this crate.
#[remain::sorted]
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GfxstreamError {
    /// The backend could not allocate GPU state for a resource.
    #[error("backend failed to allocate {0:?}")]
    BackendAllocation(ResourceKind),
    /// The sending half of a completion was dropped without firing it.
    #[error("completion was dropped before the command ran")]
    CompletionDropped,
    /// The snapshot stream is malformed.
    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
    /// A handle names a resource of a different kind than the operation needs.
    #[error("handle {handle} is a {found:?}, expected {expected:?}")]
    InvalidKind {
        handle: ResourceHandle,
        expected: ResourceKind,
        found: ResourceKind,
    },
    /// No resources are registered for the given process.
    #[error("invalid process id {0}")]
    InvalidProcessId(ProcessId),
    /// The handle is not in the registry.
    #[error("invalid resource handle {0}")]
    InvalidResourceHandle(ResourceHandle),
    /// An input/output error occurred.
    #[error("an input/output error occurred: {0}")]
    IoError(#[from] IoError),
    /// The snapshot asks for more memory than could be reserved.
    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },
    /// A value did not fit the wire representation.
    #[error("integer conversion failed: {0}")]
    TryFromIntError(#[from] TryFromIntError),
    /// A snapshot section or request opcode is not understood.
    #[error("unsupported {0}")]
    Unsupported(&'static str),
    /// The worker has stopped and no longer accepts commands.
    #[error("worker {0} has stopped")]
    WorkerStopped(&'static str),
}

/// The result of an operation in this crate.
pub type GfxstreamResult<T> = std::result::Result<T, GfxstreamError>;
