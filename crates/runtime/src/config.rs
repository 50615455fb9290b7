//! VM configuration and host hooks.
//!
//! A VM is created from a [`VmParams`] record: heap sizing knobs plus the
//! host's [`Host`] implementation. The trait replaces the C-style callback
//! record — host state that would have traveled through a `user_data`
//! pointer lives in the implementing struct instead. Every hook has a no-op
//! default, so embedders implement only what they need.

use crate::error::ErrorCode;

/// Host services the VM calls out to. All calls are synchronous and happen
/// on the thread driving the VM.
pub trait Host {
    /// Receive script output (the `std:io` `print` function routes here).
    fn print(&mut self, _text: &str) {}

    /// Receive an error report. During unwinding this is called once with
    /// the error itself, then with `StackTraceBegin`, one
    /// `StackTraceFrame` per popped frame, and `StackTraceEnd`.
    /// `context` carries the module or function name the code refers to.
    fn error(&mut self, _code: ErrorCode, _context: &str, _line: u32, _message: &str) {}

    /// Produce the source text for `import "name"`. Returning `None`
    /// surfaces as a compile error at the import site.
    fn load_module(&mut self, _name: &str) -> Option<String> {
        None
    }
}

/// Host that ignores everything; the default for [`VmParams`].
pub struct DefaultHost;

impl Host for DefaultHost {}

/// Construction parameters for a VM instance.
pub struct VmParams {
    /// The collector never shrinks its trigger threshold below this.
    pub min_heap_size: usize,
    /// Initial collection threshold.
    pub initial_heap_size: usize,
    /// After a collection the threshold becomes
    /// `bytes_allocated * (1 + heap_growth_factor)`, floored at
    /// `min_heap_size`.
    pub heap_growth_factor: f64,
    pub host: Box<dyn Host>,
}

impl VmParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: Box<dyn Host>) -> Self {
        self.host = host;
        self
    }

    pub fn with_min_heap_size(mut self, bytes: usize) -> Self {
        self.min_heap_size = bytes;
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = bytes;
        self
    }

    pub fn with_heap_growth_factor(mut self, factor: f64) -> Self {
        self.heap_growth_factor = factor;
        self
    }
}

impl Default for VmParams {
    fn default() -> Self {
        VmParams {
            min_heap_size: 1024 * 1024,
            initial_heap_size: 5 * 1024 * 1024,
            heap_growth_factor: 0.5,
            host: Box::new(DefaultHost),
        }
    }
}
