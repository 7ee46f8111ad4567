// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end protocol walks on small systems, checking the states each
//! controller passes through.

use coherence::RequestKind;

use crate::dma_access::{run_dma_read, run_dma_write};
use crate::shared_line::{run_steps, SHARED};

mod dma_access;
mod shared_line;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let trace = run_steps(&[(1, RequestKind::IFetch), (2, RequestKind::Store(0x2a))])?;
    log::info!("holders {:?}", trace.holders);
    for (cpu, path) in trace.paths.iter().enumerate() {
        log::info!("L1 {} at {}: {}", cpu, SHARED, path.join(" -> "));
    }

    for (name, outcome) in [("write", run_dma_write()?), ("read", run_dma_read()?)].iter() {
        log::info!(
            "DMA {}: L1 {}, {} recalls, memory word {:#x}",
            name,
            outcome.path.join(" -> "),
            outcome.directory_recalls,
            outcome.memory_word
        );
    }
    Ok(())
}
