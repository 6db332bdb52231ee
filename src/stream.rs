//! Stream adapter between the engine's save/load entry points and managed
//! readers and writers.
//!
//! The engine sees an fread/fwrite-shaped pair of functions. Each call is
//! handled element by element: an element is either transferred whole or the
//! call stops, and the return value is the number of whole elements moved.
//! A read returning fewer elements than requested means end of data. Errors
//! from the managed side are stored in the context so the caller can report
//! them instead of the engine's generic status.

use crate::ffi::NativeStream;
use crate::registry::{self, Context, ContextKind, Registered, Token};
use std::io::{self, Read, Write};
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};

pub(crate) struct ReadContext<'a> {
    reader: &'a mut dyn Read,
    pub(crate) error: Option<io::Error>,
    pub(crate) bytes: u64,
}

impl Context for ReadContext<'_> {
    const KIND: ContextKind = ContextKind::Reader;
}

impl<'a> ReadContext<'a> {
    pub(crate) fn new(reader: &'a mut dyn Read) -> Self {
        Self {
            reader,
            error: None,
            bytes: 0,
        }
    }

    /// Fill `element` completely. `Ok(false)` on end of data.
    fn read_element(&mut self, element: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < element.len() {
            match self.reader.read(&mut element[filled..]) {
                Ok(0) => return Ok(false),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.bytes += filled as u64;
        Ok(true)
    }

    fn read(&mut self, buffer: &mut [u8], size: usize) -> usize {
        let mut elements = 0;
        for element in buffer.chunks_exact_mut(size) {
            match self.read_element(element) {
                Ok(true) => elements += 1,
                Ok(false) => break,
                Err(e) => {
                    self.error = Some(e);
                    break;
                }
            }
        }
        elements
    }
}

pub(crate) struct WriteContext<'a> {
    writer: &'a mut dyn Write,
    pub(crate) error: Option<io::Error>,
    pub(crate) bytes: u64,
}

impl Context for WriteContext<'_> {
    const KIND: ContextKind = ContextKind::Writer;
}

impl<'a> WriteContext<'a> {
    pub(crate) fn new(writer: &'a mut dyn Write) -> Self {
        Self {
            writer,
            error: None,
            bytes: 0,
        }
    }

    fn write(&mut self, buffer: &[u8], size: usize) -> usize {
        // Once the writer has failed, nothing after the gap may be accepted.
        if self.error.is_some() {
            return 0;
        }
        let mut elements = 0;
        for element in buffer.chunks_exact(size) {
            if let Err(e) = self.writer.write_all(element) {
                self.error = Some(e);
                break;
            }
            self.bytes += element.len() as u64;
            elements += 1;
        }
        elements
    }
}

/// Stream descriptor for a load through `context`.
pub(crate) fn reader_stream(context: &Registered<ReadContext<'_>>) -> NativeStream {
    NativeStream {
        user_data: context.user_data(),
        read: Some(stream_read),
        write: None,
    }
}

/// Stream descriptor for a save through `context`.
pub(crate) fn writer_stream(context: &Registered<WriteContext<'_>>) -> NativeStream {
    NativeStream {
        user_data: context.user_data(),
        read: None,
        write: Some(stream_write),
    }
}

fn element_bytes(size: usize, count: usize) -> Option<usize> {
    size.checked_mul(count)
}

pub(crate) unsafe extern "C" fn stream_read(
    ptr: *mut c_void,
    size: usize,
    count: usize,
    user_data: *mut c_void,
) -> usize {
    if size == 0 || count == 0 {
        return 0;
    }
    let Some(len) = element_bytes(size, count) else {
        return 0;
    };
    if ptr.is_null() {
        return 0;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let context = unsafe { registry::resolve::<ReadContext<'_>>(user_data) }?;
        let buffer = unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), len) };
        Ok::<_, crate::BridgeError>(context.read(buffer, size))
    }));

    match outcome {
        Ok(Ok(elements)) => elements,
        Ok(Err(err)) => {
            tracing::error!(error = %err, "stream read for unregistered context");
            registry::note_unresolved(user_data as Token);
            0
        }
        Err(_) => {
            tracing::error!("panic in stream read");
            0
        }
    }
}

pub(crate) unsafe extern "C" fn stream_write(
    ptr: *const c_void,
    size: usize,
    count: usize,
    user_data: *mut c_void,
) -> usize {
    if size == 0 || count == 0 {
        return 0;
    }
    let Some(len) = element_bytes(size, count) else {
        return 0;
    };
    if ptr.is_null() {
        return 0;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let context = unsafe { registry::resolve::<WriteContext<'_>>(user_data) }?;
        let buffer = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) };
        Ok::<_, crate::BridgeError>(context.write(buffer, size))
    }));

    match outcome {
        Ok(Ok(elements)) => elements,
        Ok(Err(err)) => {
            tracing::error!(error = %err, "stream write for unregistered context");
            registry::note_unresolved(user_data as Token);
            0
        }
        Err(_) => {
            tracing::error!("panic in stream write");
            0
        }
    }
}
