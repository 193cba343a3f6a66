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
/// dbgmux multiplexes debug sessions over the browser devtools wire
/// protocol and the native debug adapter protocol behind one control
/// socket, with session state queryable through a SQL subset.
use std::process;

use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let args = libdbgmux::Args::parse();

    if args.version() {
        println!("dbgmux {}", VERSION);
        return;
    }

    if let Err(err) = libdbgmux::run(args) {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}
