//! The conductor couples mutator-side collection requests to the collector
//! thread's cycle boundary: one mutex, a `running` flag, and a condition
//! variable in each direction. Any number of synchronous waiters collapse
//! onto the single in-flight cycle.

use parking_lot::{Condvar, Mutex};

struct Gate {
    running: bool,
    shutdown: bool,
}

pub(crate) struct Conductor {
    gate: Mutex<Gate>,
    wake: Condvar,
    done: Condvar,
}

impl Conductor {
    /// Starts in the running state; the collector announces readiness by
    /// finishing its zeroth "cycle", which is what [`Conductor::wait_idle`]
    /// synchronises with during runtime construction.
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(Gate {
                running: true,
                shutdown: false,
            }),
            wake: Condvar::new(),
            done: Condvar::new(),
        }
    }

    /// Request a collection unless one is already running or requested.
    pub fn wake(&self) {
        let mut gate = self.gate.lock();
        if !gate.running {
            gate.running = true;
            self.wake.notify_one();
        }
    }

    /// Request a collection and block until the cycle that serves it
    /// finishes. The caller must not be in a state a handshake would wait
    /// on (mutators park first).
    pub fn wait(&self) {
        let mut gate = self.gate.lock();
        if !gate.running {
            gate.running = true;
            self.wake.notify_one();
        }
        while gate.running && !gate.shutdown {
            self.done.wait(&mut gate);
        }
    }

    /// Block until the collector is idle. Used once at startup.
    pub fn wait_idle(&self) {
        let mut gate = self.gate.lock();
        while gate.running && !gate.shutdown {
            self.done.wait(&mut gate);
        }
    }

    /// Collector side: report the previous cycle done and sleep until the
    /// next request. Returns false when the runtime is shutting down.
    pub fn next(&self) -> bool {
        let mut gate = self.gate.lock();
        gate.running = false;
        self.done.notify_all();
        while !gate.running && !gate.shutdown {
            self.wake.wait(&mut gate);
        }
        !gate.shutdown
    }

    /// Stop the collector thread after the cycle in flight, if any.
    pub fn shutdown(&self) {
        let mut gate = self.gate.lock();
        gate.shutdown = true;
        self.wake.notify_all();
        self.done.notify_all();
    }
}
