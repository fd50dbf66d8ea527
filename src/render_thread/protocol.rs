// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Requests a guest connection sends to its producer, and their fixed-layout records.

use std::io::Read;
use std::io::Write;
use std::mem::size_of;

use zerocopy::byteorder::BigEndian;
use zerocopy::byteorder::U32;
use zerocopy::byteorder::U64;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::backend::ColorBufferParams;
use crate::backend::ContextParams;
use crate::backend::DataBufferParams;
use crate::backend::WindowSurfaceParams;
use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;
use crate::handle::ProcessId;
use crate::handle::ResourceHandle;
use crate::handle::INVALID_HANDLE;

pub const GFXSTREAM_REQUEST_SET_PROCESS_ID: u32 = 0x1;
pub const GFXSTREAM_REQUEST_CREATE_COLOR_BUFFER: u32 = 0x2;
pub const GFXSTREAM_REQUEST_OPEN_COLOR_BUFFER: u32 = 0x3;
pub const GFXSTREAM_REQUEST_CLOSE_COLOR_BUFFER: u32 = 0x4;
pub const GFXSTREAM_REQUEST_CREATE_BUFFER: u32 = 0x5;
pub const GFXSTREAM_REQUEST_CLOSE_BUFFER: u32 = 0x6;
pub const GFXSTREAM_REQUEST_CREATE_CONTEXT: u32 = 0x7;
pub const GFXSTREAM_REQUEST_DESTROY_CONTEXT: u32 = 0x8;
pub const GFXSTREAM_REQUEST_CREATE_WINDOW_SURFACE: u32 = 0x9;
pub const GFXSTREAM_REQUEST_DESTROY_WINDOW_SURFACE: u32 = 0xa;
pub const GFXSTREAM_REQUEST_SET_WINDOW_SURFACE_COLOR_BUFFER: u32 = 0xb;
pub const GFXSTREAM_REQUEST_POST: u32 = 0xc;
pub const GFXSTREAM_REQUEST_LAST_COLOR_BUFFER_REF: u32 = 0xd;
pub const GFXSTREAM_REQUEST_FINISH: u32 = 0xe;

/// One guest request. Creation requests carry `INVALID_HANDLE` to let the registry choose.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestRequest {
    SetProcessId(ProcessId),
    CreateColorBuffer {
        params: ColorBufferParams,
        handle: ResourceHandle,
    },
    OpenColorBuffer(ResourceHandle),
    CloseColorBuffer(ResourceHandle),
    CreateBuffer {
        params: DataBufferParams,
        handle: ResourceHandle,
    },
    CloseBuffer(ResourceHandle),
    CreateContext(ContextParams),
    DestroyContext(ResourceHandle),
    CreateWindowSurface(WindowSurfaceParams),
    DestroyWindowSurface(ResourceHandle),
    SetWindowSurfaceColorBuffer {
        surface: ResourceHandle,
        color_buffer: ResourceHandle,
    },
    Post(ResourceHandle),
    LastColorBufferRef(ResourceHandle),
    Finish,
}

/// Written back in request order, one per request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestResponse {
    Ok,
    Handle(ResourceHandle),
    Status(bool),
}

/// The persisted form of a `GuestRequest`.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
pub struct GuestRequestRecord {
    pub opcode: U32<BigEndian>,
    pub handle: U32<BigEndian>,
    pub args: [U32<BigEndian>; 4],
    pub wide: U64<BigEndian>,
}

pub const GUEST_REQUEST_RECORD_SIZE: usize = size_of::<GuestRequestRecord>();

impl GuestRequestRecord {
    fn new(opcode: u32, handle: ResourceHandle, args: [u32; 4], wide: u64) -> GuestRequestRecord {
        GuestRequestRecord {
            opcode: U32::new(opcode),
            handle: U32::new(handle),
            args: args.map(U32::new),
            wide: U64::new(wide),
        }
    }

    fn arg(&self, index: usize) -> u32 {
        self.args[index].get()
    }
}

impl GuestRequest {
    pub fn to_record(&self) -> GuestRequestRecord {
        use GuestRequest::*;
        match *self {
            SetProcessId(pid) => {
                GuestRequestRecord::new(GFXSTREAM_REQUEST_SET_PROCESS_ID, 0, [0; 4], pid)
            }
            CreateColorBuffer { params, handle } => GuestRequestRecord::new(
                GFXSTREAM_REQUEST_CREATE_COLOR_BUFFER,
                handle,
                [
                    params.width,
                    params.height,
                    params.internal_format,
                    params.framework_format,
                ],
                0,
            ),
            OpenColorBuffer(handle) => {
                GuestRequestRecord::new(GFXSTREAM_REQUEST_OPEN_COLOR_BUFFER, handle, [0; 4], 0)
            }
            CloseColorBuffer(handle) => {
                GuestRequestRecord::new(GFXSTREAM_REQUEST_CLOSE_COLOR_BUFFER, handle, [0; 4], 0)
            }
            CreateBuffer { params, handle } => GuestRequestRecord::new(
                GFXSTREAM_REQUEST_CREATE_BUFFER,
                handle,
                [params.memory_property, 0, 0, 0],
                params.size,
            ),
            CloseBuffer(handle) => {
                GuestRequestRecord::new(GFXSTREAM_REQUEST_CLOSE_BUFFER, handle, [0; 4], 0)
            }
            CreateContext(params) => GuestRequestRecord::new(
                GFXSTREAM_REQUEST_CREATE_CONTEXT,
                0,
                [params.config, params.share_context, params.version, 0],
                0,
            ),
            DestroyContext(handle) => {
                GuestRequestRecord::new(GFXSTREAM_REQUEST_DESTROY_CONTEXT, handle, [0; 4], 0)
            }
            CreateWindowSurface(params) => GuestRequestRecord::new(
                GFXSTREAM_REQUEST_CREATE_WINDOW_SURFACE,
                0,
                [params.config, params.width, params.height, 0],
                0,
            ),
            DestroyWindowSurface(handle) => GuestRequestRecord::new(
                GFXSTREAM_REQUEST_DESTROY_WINDOW_SURFACE,
                handle,
                [0; 4],
                0,
            ),
            SetWindowSurfaceColorBuffer {
                surface,
                color_buffer,
            } => GuestRequestRecord::new(
                GFXSTREAM_REQUEST_SET_WINDOW_SURFACE_COLOR_BUFFER,
                surface,
                [color_buffer, 0, 0, 0],
                0,
            ),
            Post(handle) => GuestRequestRecord::new(GFXSTREAM_REQUEST_POST, handle, [0; 4], 0),
            LastColorBufferRef(handle) => GuestRequestRecord::new(
                GFXSTREAM_REQUEST_LAST_COLOR_BUFFER_REF,
                handle,
                [0; 4],
                0,
            ),
            Finish => GuestRequestRecord::new(GFXSTREAM_REQUEST_FINISH, 0, [0; 4], 0),
        }
    }

    pub fn from_record(record: &GuestRequestRecord) -> GfxstreamResult<GuestRequest> {
        let handle = record.handle.get();
        let request = match record.opcode.get() {
            GFXSTREAM_REQUEST_SET_PROCESS_ID => GuestRequest::SetProcessId(record.wide.get()),
            GFXSTREAM_REQUEST_CREATE_COLOR_BUFFER => GuestRequest::CreateColorBuffer {
                params: ColorBufferParams {
                    width: record.arg(0),
                    height: record.arg(1),
                    internal_format: record.arg(2),
                    framework_format: record.arg(3),
                },
                handle,
            },
            GFXSTREAM_REQUEST_OPEN_COLOR_BUFFER => GuestRequest::OpenColorBuffer(handle),
            GFXSTREAM_REQUEST_CLOSE_COLOR_BUFFER => GuestRequest::CloseColorBuffer(handle),
            GFXSTREAM_REQUEST_CREATE_BUFFER => GuestRequest::CreateBuffer {
                params: DataBufferParams {
                    size: record.wide.get(),
                    memory_property: record.arg(0),
                },
                handle,
            },
            GFXSTREAM_REQUEST_CLOSE_BUFFER => GuestRequest::CloseBuffer(handle),
            GFXSTREAM_REQUEST_CREATE_CONTEXT => GuestRequest::CreateContext(ContextParams {
                config: record.arg(0),
                share_context: record.arg(1),
                version: record.arg(2),
            }),
            GFXSTREAM_REQUEST_DESTROY_CONTEXT => GuestRequest::DestroyContext(handle),
            GFXSTREAM_REQUEST_CREATE_WINDOW_SURFACE => {
                GuestRequest::CreateWindowSurface(WindowSurfaceParams {
                    config: record.arg(0),
                    width: record.arg(1),
                    height: record.arg(2),
                })
            }
            GFXSTREAM_REQUEST_DESTROY_WINDOW_SURFACE => GuestRequest::DestroyWindowSurface(handle),
            GFXSTREAM_REQUEST_SET_WINDOW_SURFACE_COLOR_BUFFER => {
                GuestRequest::SetWindowSurfaceColorBuffer {
                    surface: handle,
                    color_buffer: record.arg(0),
                }
            }
            GFXSTREAM_REQUEST_POST => GuestRequest::Post(handle),
            GFXSTREAM_REQUEST_LAST_COLOR_BUFFER_REF => GuestRequest::LastColorBufferRef(handle),
            GFXSTREAM_REQUEST_FINISH => GuestRequest::Finish,
            _ => return Err(GfxstreamError::Corrupt("unknown guest request opcode")),
        };
        Ok(request)
    }

    /// The handle a creation request asks for, if the guest picked one.
    pub fn requested_handle(&self) -> Option<ResourceHandle> {
        match *self {
            GuestRequest::CreateColorBuffer { handle, .. }
            | GuestRequest::CreateBuffer { handle, .. }
                if handle != INVALID_HANDLE =>
            {
                Some(handle)
            }
            _ => None,
        }
    }
}

pub fn write_request(writer: &mut dyn Write, request: &GuestRequest) -> GfxstreamResult<()> {
    writer.write_all(request.to_record().as_bytes())?;
    Ok(())
}

pub fn read_request(reader: &mut dyn Read) -> GfxstreamResult<GuestRequest> {
    let mut bytes = [0u8; GUEST_REQUEST_RECORD_SIZE];
    reader.read_exact(&mut bytes)?;
    let record = GuestRequestRecord::read_from(&bytes[..])
        .ok_or(GfxstreamError::Corrupt("short guest request record"))?;
    GuestRequest::from_record(&record)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn record_layout_is_fixed() {
        assert_eq!(GUEST_REQUEST_RECORD_SIZE, 32);
        let record = GuestRequest::SetProcessId(0x0102).to_record();
        let bytes = record.as_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[24..], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn requests_survive_the_stream() {
        let requests = [
            GuestRequest::CreateColorBuffer {
                params: ColorBufferParams {
                    width: 64,
                    height: 32,
                    internal_format: 0x1908,
                    framework_format: 1,
                },
                handle: 7,
            },
            GuestRequest::CreateBuffer {
                params: DataBufferParams {
                    size: 1 << 33,
                    memory_property: 2,
                },
                handle: INVALID_HANDLE,
            },
            GuestRequest::SetWindowSurfaceColorBuffer {
                surface: 3,
                color_buffer: 4,
            },
            GuestRequest::Finish,
        ];

        let mut bytes = Vec::new();
        for request in &requests {
            write_request(&mut bytes, request).unwrap();
        }
        let mut cursor = Cursor::new(bytes);
        for request in &requests {
            assert_eq!(read_request(&mut cursor).unwrap(), *request);
        }
        assert_eq!(requests[0].requested_handle(), Some(7));
        assert_eq!(requests[1].requested_handle(), None);
    }

    #[test]
    fn unknown_opcode_is_corrupt() {
        let mut record = GuestRequest::Finish.to_record();
        record.opcode = U32::new(0xff);
        assert!(matches!(
            GuestRequest::from_record(&record),
            Err(GfxstreamError::Corrupt(_))
        ));
    }
}
