//! Python bindings for shmq

use pyo3::buffer::PyBuffer;
use pyo3::exceptions::{PyBufferError, PyFileNotFoundError, PyRuntimeError, PyValueError};
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::{PyByteArray, PyBytes};
use pyo3::AsPyPointer;
use shmq_core::{Error, Queue};
use std::cell::Cell;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr::{self, NonNull};

/// Convert shmq error to Python exception
fn to_py_err(e: Error) -> PyErr {
    match e {
        Error::NotFound(_) => PyFileNotFoundError::new_err(e.to_string()),
        Error::InvalidName { .. }
        | Error::InvalidCapacity
        | Error::CapacityOverflow { .. }
        | Error::RecordSize { .. } => PyValueError::new_err(e.to_string()),
        e => PyRuntimeError::new_err(e.to_string()),
    }
}

/// Python wrapper for Queue
#[pyclass(unsendable, name = "SMQueue")]
struct SMQueue {
    inner: Queue,
    /// Slots handed out through `borrow()` and not yet released
    borrowed: Cell<usize>,
}

impl SMQueue {
    fn wrap(inner: Queue) -> Self {
        Self {
            inner,
            borrowed: Cell::new(0),
        }
    }

    fn check_len(&self, len: usize) -> PyResult<()> {
        if len != self.inner.element_size() {
            return Err(PyValueError::new_err(format!(
                "array size {} does not match element size {}",
                len,
                self.inner.element_size()
            )));
        }
        Ok(())
    }
}

#[pymethods]
impl SMQueue {
    /// Create a new shared memory queue
    #[staticmethod]
    fn create(name: &str, max_elements: usize, element_size: usize) -> PyResult<Self> {
        Queue::create(name, max_elements, element_size)
            .map(Self::wrap)
            .map_err(to_py_err)
    }

    /// Open an existing shared memory queue
    #[staticmethod]
    fn open(name: &str) -> PyResult<Self> {
        Queue::open(name).map(Self::wrap).map_err(to_py_err)
    }

    /// Destroy a shared memory queue; a missing queue is not an error
    #[staticmethod]
    fn destroy(name: &str) -> PyResult<()> {
        Queue::destroy(name).map_err(to_py_err)
    }

    fn close(&mut self) -> PyResult<()> {
        if self.borrowed.get() > 0 {
            return Err(PyRuntimeError::new_err(format!(
                "{} borrowed slots are still alive",
                self.borrowed.get()
            )));
        }
        self.inner.close();
        Ok(())
    }

    fn max_elements(&self) -> usize {
        self.inner.max_elements()
    }

    fn element_size(&self) -> usize {
        self.inner.element_size()
    }

    fn name(&self) -> String {
        self.inner.name().to_string()
    }

    fn __len__(&self) -> PyResult<usize> {
        self.inner.len().map_err(to_py_err)
    }

    /// Push a record; returns False if the oldest record was dropped
    fn push(&self, py: Python<'_>, data: PyBuffer<u8>) -> PyResult<bool> {
        self.check_len(data.item_count())?;
        if data.is_c_contiguous() {
            let record =
                unsafe { std::slice::from_raw_parts(data.buf_ptr() as *const u8, data.len_bytes()) };
            self.inner.push(record).map_err(to_py_err)
        } else {
            let record = data.to_vec(py)?;
            self.inner.push(&record).map_err(to_py_err)
        }
    }

    /// Pop a record, blocking until one is available
    fn pop(&self, py: Python<'_>) -> PyResult<PyObject> {
        let mut buf = vec![0u8; self.inner.element_size()];
        let inner = &self.inner;
        py.allow_threads(|| inner.pop(&mut buf)).map_err(to_py_err)?;
        Ok(PyBytes::new(py, &buf).into())
    }

    /// Pop a record if one is available, otherwise return None
    fn try_pop(&self, py: Python<'_>) -> PyResult<Option<PyObject>> {
        let mut buf = vec![0u8; self.inner.element_size()];
        if self.inner.try_pop(&mut buf).map_err(to_py_err)? {
            Ok(Some(PyBytes::new(py, &buf).into()))
        } else {
            Ok(None)
        }
    }

    /// Non-blocking pop into a pre-allocated bytearray
    fn try_pop_into(&self, dst: &PyByteArray) -> PyResult<bool> {
        self.check_len(dst.len())?;
        let buf = unsafe { dst.as_bytes_mut() };
        self.inner.try_pop(buf).map_err(to_py_err)
    }

    /// Borrow the oldest record without copying it
    ///
    /// The returned slot supports the buffer protocol and is released when
    /// it is garbage-collected or `release()` is called.
    fn borrow(slf: &PyCell<Self>) -> PyResult<Option<BorrowedSlot>> {
        let this = slf.borrow();
        let Some(slot) = this.inner.borrow().map_err(to_py_err)? else {
            return Ok(None);
        };
        let (ptr, index) = slot.into_raw();
        this.borrowed.set(this.borrowed.get() + 1);

        Ok(Some(BorrowedSlot {
            queue: slf.into(),
            ptr,
            len: this.inner.element_size(),
            index,
            released: false,
            exports: 0,
        }))
    }
}

/// Zero-copy view of a popped slot
#[pyclass(unsendable)]
struct BorrowedSlot {
    /// Keeps the mapping alive while the slot is readable
    queue: Py<SMQueue>,
    ptr: NonNull<u8>,
    len: usize,
    index: usize,
    released: bool,
    /// Buffer views currently exported to Python
    exports: usize,
}

impl BorrowedSlot {
    fn commit(&mut self, py: Python<'_>) {
        if self.released {
            return;
        }
        self.released = true;
        if let Ok(queue) = self.queue.try_borrow(py) {
            queue.borrowed.set(queue.borrowed.get().saturating_sub(1));
            let _ = queue.inner.commit_pop(self.index);
        }
    }

    fn check_live(&self) -> PyResult<()> {
        if self.released {
            return Err(PyBufferError::new_err("slot already released"));
        }
        Ok(())
    }
}

#[pymethods]
impl BorrowedSlot {
    #[getter]
    fn index(&self) -> usize {
        self.index
    }

    fn __len__(&self) -> usize {
        self.len
    }

    /// Copy the slot into a bytes object
    fn tobytes(&self, py: Python<'_>) -> PyResult<PyObject> {
        self.check_live()?;
        let data = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        Ok(PyBytes::new(py, data).into())
    }

    /// Release the slot before the object is garbage-collected
    fn release(&mut self, py: Python<'_>) -> PyResult<()> {
        if self.exports > 0 {
            return Err(PyBufferError::new_err("slot is still exported as a buffer"));
        }
        self.commit(py);
        Ok(())
    }

    unsafe fn __getbuffer__(
        slf: &PyCell<Self>,
        view: *mut ffi::Py_buffer,
        flags: c_int,
    ) -> PyResult<()> {
        if view.is_null() {
            return Err(PyBufferError::new_err("view is null"));
        }
        if (flags & ffi::PyBUF_WRITABLE) == ffi::PyBUF_WRITABLE {
            return Err(PyBufferError::new_err("borrowed slots are read-only"));
        }
        let mut this = slf.try_borrow_mut()?;
        this.check_live()?;

        let obj = slf.as_ptr();
        ffi::Py_INCREF(obj);
        (*view).obj = obj;

        (*view).buf = this.ptr.as_ptr() as *mut c_void;
        (*view).len = this.len as isize;
        (*view).readonly = 1;
        (*view).itemsize = 1;

        (*view).format = if (flags & ffi::PyBUF_FORMAT) == ffi::PyBUF_FORMAT {
            b"B\0".as_ptr() as *mut c_char
        } else {
            ptr::null_mut()
        };

        (*view).ndim = 1;
        (*view).shape = if (flags & ffi::PyBUF_ND) == ffi::PyBUF_ND {
            &mut (*view).len
        } else {
            ptr::null_mut()
        };
        (*view).strides = if (flags & ffi::PyBUF_STRIDES) == ffi::PyBUF_STRIDES {
            &mut (*view).itemsize
        } else {
            ptr::null_mut()
        };
        (*view).suboffsets = ptr::null_mut();
        (*view).internal = ptr::null_mut();

        this.exports += 1;
        Ok(())
    }

    unsafe fn __releasebuffer__(slf: &PyCell<Self>, _view: *mut ffi::Py_buffer) {
        if let Ok(mut this) = slf.try_borrow_mut() {
            this.exports = this.exports.saturating_sub(1);
        }
    }
}

impl Drop for BorrowedSlot {
    fn drop(&mut self) {
        if !self.released {
            Python::with_gil(|py| self.commit(py));
        }
    }
}

#[pymodule]
fn shmq(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<SMQueue>()?;
    m.add_class::<BorrowedSlot>()?;
    Ok(())
}
