//! The probe-then-fill sizing protocol
//!
//! Every sized native call (value, XML and bookmark rendering, message
//! formatting) is made twice: once with an empty buffer to learn the
//! required size, then once with a buffer of exactly that size. The
//! outcomes are classified in one place:
//!
//! | probe                          | result                         |
//! |--------------------------------|--------------------------------|
//! | insufficient buffer, size `n>0`| allocate `n`, fill             |
//! | insufficient buffer, size `0`  | [`RenderError::UnexpectedSize`]|
//! | success, size `0`              | empty result                   |
//! | success, size `n>0`            | [`RenderError::UnexpectedSize`]|
//! | any other status               | [`RenderError::RenderFailure`] |
//!
//! A fill that fails with an out-of-memory status is
//! [`RenderError::OutOfMemory`]; any other fill failure, including a second
//! insufficient-buffer report, is a render failure. There is no third call.

use std::marker::PhantomData;
use std::mem::size_of;

use bytemuck::Pod;
use tracing::trace;
use winlog_core::{DecodeError, DecodeResult, FillReport, RenderedValueSet, Status};

use crate::error::{RenderError, RenderResult};

/// The output of a successful fill, in 8-byte-aligned storage
#[derive(Debug)]
pub struct Filled<U> {
    storage: Vec<u64>,
    len: usize,
    property_count: u32,
    _unit: PhantomData<U>,
}

impl<U: Pod> Filled<U> {
    fn empty(property_count: u32) -> Self {
        Self {
            storage: Vec::new(),
            len: 0,
            property_count,
            _unit: PhantomData,
        }
    }

    /// The units the fill reported as used
    pub fn units(&self) -> &[U] {
        &bytemuck::cast_slice::<u64, U>(&self.storage)[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn property_count(&self) -> u32 {
        self.property_count
    }
}

impl Filled<u8> {
    /// Reinterpret a byte render as the packed variant array it holds
    pub fn into_value_set(self) -> DecodeResult<RenderedValueSet> {
        if self.len == 0 {
            return Ok(RenderedValueSet::empty());
        }
        RenderedValueSet::from_aligned(self.storage, self.len, self.property_count)
    }

    /// Reinterpret a byte render as UTF-16 text units
    pub fn as_wide(&self) -> DecodeResult<&[u16]> {
        if self.len % 2 != 0 {
            return Err(DecodeError::malformed(format!(
                "text render of {} bytes is not whole UTF-16 units",
                self.len
            )));
        }
        Ok(&bytemuck::cast_slice::<u64, u16>(&self.storage)[..self.len / 2])
    }
}

/// Run `call` as a probe, then as a fill into a buffer of exactly the probed size
pub fn probe_and_fill<U, F>(op: &'static str, mut call: F) -> RenderResult<Filled<U>>
where
    U: Pod,
    F: FnMut(&mut [U]) -> FillReport,
{
    let probe = call(&mut []);
    let required = match probe.status {
        Status::INSUFFICIENT_BUFFER if probe.required > 0 => probe.required,
        Status::SUCCESS if probe.required == 0 => return Ok(Filled::empty(probe.property_count)),
        Status::INSUFFICIENT_BUFFER | Status::SUCCESS => {
            return Err(RenderError::UnexpectedSize {
                op,
                status: probe.status,
                reported: probe.required,
            });
        }
        status => return Err(RenderError::failure(op, status)),
    };

    let bytes = required
        .checked_mul(size_of::<U>())
        .ok_or(RenderError::OutOfMemory { op, bytes: usize::MAX })?;
    let words = bytes.div_ceil(size_of::<u64>());
    let mut storage: Vec<u64> = Vec::new();
    storage
        .try_reserve_exact(words)
        .map_err(|_| RenderError::OutOfMemory { op, bytes })?;
    storage.resize(words, 0);

    let fill = call(&mut bytemuck::cast_slice_mut::<u64, U>(&mut storage)[..required]);
    trace!(op, required, status = %fill.status, "sized call filled");
    match fill.status {
        Status::SUCCESS if fill.required <= required => Ok(Filled {
            storage,
            len: fill.required,
            property_count: fill.property_count,
            _unit: PhantomData,
        }),
        Status::SUCCESS => Err(RenderError::UnexpectedSize {
            op,
            status: fill.status,
            reported: fill.required,
        }),
        status if status.is_out_of_memory() => Err(RenderError::OutOfMemory { op, bytes }),
        status => Err(RenderError::failure(op, status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_uses_exact_probed_size() {
        let units: Vec<u16> = "Information".encode_utf16().chain([0]).collect();
        let mut seen = Vec::new();
        let filled = probe_and_fill::<u16, _>("format message", |buf| {
            seen.push(buf.len());
            if buf.len() < units.len() {
                return FillReport::needs(units.len());
            }
            buf[..units.len()].copy_from_slice(&units);
            FillReport::filled(units.len(), 0)
        })
        .unwrap();

        assert_eq!(seen, vec![0, units.len()]);
        assert_eq!(filled.units(), units.as_slice());
    }

    #[test]
    fn test_zero_size_success_is_empty() {
        let filled = probe_and_fill::<u8, _>("render", |_| FillReport::filled(0, 0)).unwrap();
        assert!(filled.is_empty());
        assert!(filled.into_value_set().unwrap().is_empty());
    }

    #[test]
    fn test_zero_size_insufficient_buffer_is_unexpected() {
        let err = probe_and_fill::<u8, _>("render", |_| FillReport::needs(0)).unwrap_err();
        assert!(matches!(err, RenderError::UnexpectedSize { reported: 0, .. }));
    }

    #[test]
    fn test_probe_success_with_size_is_unexpected() {
        let err = probe_and_fill::<u8, _>("render", |_| FillReport::filled(32, 2)).unwrap_err();
        assert!(matches!(err, RenderError::UnexpectedSize { reported: 32, .. }));
    }

    #[test]
    fn test_probe_failure_is_render_failure() {
        let err = probe_and_fill::<u8, _>("render", |_| FillReport::failed(Status::INVALID_HANDLE))
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::RenderFailure {
                status: Status::INVALID_HANDLE,
                ..
            }
        ));
    }

    #[test]
    fn test_fill_failures_are_classified() {
        for (status, oom) in [
            (Status::NOT_ENOUGH_MEMORY, true),
            (Status::OUTOFMEMORY, true),
            (Status::INVALID_PARAMETER, false),
            (Status::INSUFFICIENT_BUFFER, false),
        ] {
            let mut calls = 0;
            let err = probe_and_fill::<u8, _>("render", |buf| {
                calls += 1;
                if buf.is_empty() {
                    FillReport::needs(16)
                } else if status == Status::INSUFFICIENT_BUFFER {
                    FillReport::needs(32)
                } else {
                    FillReport::failed(status)
                }
            })
            .unwrap_err();
            assert_eq!(calls, 2, "no third attempt for {}", status);
            if oom {
                assert!(matches!(err, RenderError::OutOfMemory { bytes: 16, .. }));
            } else {
                assert!(matches!(err, RenderError::RenderFailure { .. }));
            }
        }
    }

    #[test]
    fn test_odd_byte_text_is_malformed() {
        let filled = probe_and_fill::<u8, _>("render", |buf| {
            if buf.is_empty() {
                FillReport::needs(3)
            } else {
                FillReport::filled(3, 0)
            }
        })
        .unwrap();
        assert!(matches!(filled.as_wide(), Err(DecodeError::Malformed(_))));
    }
}
