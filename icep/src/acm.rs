// Copyright © 2026 The icep Developers
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # ACTIVE CONNECTION MANAGEMENT
//!
//! The heartbeat-and-idle-close policy. A [Connection Monitor] wakes every
//! half [Timeout] and asks each registered connection to [Check] itself:
//! heartbeats keep a quiet connection alive per the [Heartbeat Policy], and
//! connections with no activity for a whole [Timeout] are closed per the
//! [Close Policy].
//!
//! [Connection Monitor]: ConnectionMonitor
//! [Check]:              crate::connection::Connection::monitor
//! [Timeout]:            AcmConfig::timeout
//! [Heartbeat Policy]:   AcmHeartbeat
//! [Close Policy]:       AcmClose

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::transport::Timer;

/// ## CLOSE POLICY
///
/// When the monitor may close a connection that has seen no activity for
/// the configured timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcmClose {
  /// Never close.
  Off,

  /// Close gracefully, but only when no requests are pending and the batch
  /// queue is empty.
  OnIdle,

  /// Close forcefully when requests are pending and unanswered for the
  /// whole timeout (the peer stopped heartbeating); never close an idle
  /// connection without pending requests.
  OnInvocation,

  /// Both of the above.
  OnInvocationAndIdle,

  /// Close forcefully at the timeout regardless of pending work.
  OnIdleForceful,
}

/// ## HEARTBEAT POLICY
///
/// When the monitor sends validate-connection frames to keep the peer's own
/// monitor satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcmHeartbeat {
  /// Never send heartbeats.
  Off,

  /// Heartbeat only while a dispatch is in progress, so a busy server keeps
  /// its client's connection alive.
  OnDispatch,

  /// Heartbeat when the connection has been quiet for a quarter timeout.
  OnIdle,

  /// Heartbeat on every monitor wakeup.
  Always,
}

/// ## ACM CONFIGURATION
#[derive(Clone, Copy, Debug)]
pub struct AcmConfig {
  /// The activity window. Heartbeats fire within it; idleness beyond it
  /// closes the connection. Zero disables the monitor entirely.
  pub timeout: Duration,
  pub close: AcmClose,
  pub heartbeat: AcmHeartbeat,
}

impl Default for AcmConfig {
  fn default() -> Self {
    AcmConfig {
      timeout: Duration::from_secs(60),
      close: AcmClose::OnInvocationAndIdle,
      heartbeat: AcmHeartbeat::OnDispatch,
    }
  }
}

/// ## CONNECTION MONITOR
///
/// Holds weak registrations of active connections and drives their
/// [Check] procedure every half timeout through the [Timer]. Dead
/// registrations are pruned as they are encountered.
///
/// [Check]: crate::connection::Connection::monitor
/// [Timer]: crate::transport::Timer
pub struct ConnectionMonitor {
  timer: Arc<dyn Timer>,
  config: AcmConfig,
  connections: Mutex<Vec<Weak<Connection>>>,
}

impl ConnectionMonitor {
  /// Creates the monitor and schedules its periodic wakeup. With a zero
  /// timeout the monitor never wakes and never closes anything.
  pub fn new(timer: Arc<dyn Timer>, config: AcmConfig) -> Arc<Self> {
    let monitor = Arc::new(ConnectionMonitor {
      timer,
      config,
      connections: Mutex::new(Vec::new()),
    });
    if !config.timeout.is_zero() {
      Self::reschedule(&monitor);
    }
    monitor
  }

  /// The policy this monitor enforces.
  pub fn config(&self) -> &AcmConfig {
    &self.config
  }

  /// Registers a connection. Registration is weak; a dropped connection
  /// unregisters itself by ceasing to exist.
  pub fn add(&self, connection: &Arc<Connection>) {
    self
      .connections
      .lock()
      .unwrap()
      .push(Arc::downgrade(connection));
  }

  /// Removes a connection eagerly, ahead of weak-pointer pruning.
  pub fn remove(&self, connection: &Arc<Connection>) {
    self
      .connections
      .lock()
      .unwrap()
      .retain(|weak| !weak.ptr_eq(&Arc::downgrade(connection)));
  }

  /// ### CHECK PROCEDURE
  ///
  /// Runs one monitoring pass over every live registration.
  pub fn check(&self, now: Instant) {
    let connections: Vec<Arc<Connection>> = {
      let mut registered = self.connections.lock().unwrap();
      registered.retain(|weak| weak.strong_count() > 0);
      registered.iter().filter_map(Weak::upgrade).collect()
    };
    for connection in connections {
      connection.monitor(now, &self.config);
    }
  }

  fn reschedule(this: &Arc<Self>) {
    let weak: Weak<Self> = Arc::downgrade(this);
    let delay: Duration = this.config.timeout / 2;
    this.timer.schedule(
      Box::new(move || {
        if let Some(monitor) = weak.upgrade() {
          monitor.check(Instant::now());
          Self::reschedule(&monitor);
        }
      }),
      delay,
    );
  }
}
