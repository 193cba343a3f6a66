// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time;

/// Where the control socket lives unless `--socket` or DBG_SOCK says
/// otherwise.
pub const DEFAULT_SOCK_PATH: &str = "/tmp/dbg.sock";

/// Overrides the control socket path.
pub const SOCK_PATH_VAR: &str = "DBG_SOCK";

/// Pins the native debug adapter binary.
pub const LLDB_DAP_PATH_VAR: &str = "LLDB_DAP_PATH";

pub const BUF_SIZE: usize = 1024 * 16;

/// Default deadline for a single wire request on either protocol.
pub const REQUEST_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// How long discovery will wait for the /json endpoint to answer.
pub const DISCOVERY_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Overall deadline for a native attach, covering every strategy tried.
pub const ATTACH_DEADLINE: time::Duration = time::Duration::from_secs(30);

/// How long a managed child gets to react to SIGTERM before we
/// escalate to SIGKILL.
pub const CHILD_KILL_TIMEOUT: time::Duration = time::Duration::from_secs(2);

/// Event store flush cadence and buffer high-water mark.
pub const STORE_FLUSH_INTERVAL: time::Duration = time::Duration::from_millis(100);
pub const STORE_FLUSH_THRESHOLD: usize = 64;

/// Cap on concurrently outstanding requests per transport. Requests
/// beyond this fail with a backpressure error rather than growing the
/// correlation map without bound.
pub const MAX_OUTSTANDING_REQUESTS: usize = 1024;

/// How much of the adapter's stderr we keep around to attach to
/// process-exit errors.
pub const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Bounds for the console and exception rings in session state.
pub const CONSOLE_RING_CAP: usize = 1024;
pub const EXCEPTION_RING_CAP: usize = 256;
pub const PAGE_EVENT_RING_CAP: usize = 512;
pub const WS_FRAME_RING_CAP: usize = 512;
