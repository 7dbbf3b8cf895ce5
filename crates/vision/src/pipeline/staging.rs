//! Ring of staging surfaces used to read rendered textures back to the CPU
//! without stalling on the copy that was just issued.
//!
//! `stage` queues a copy into the slot under the cursor and moves on; `sync`
//! maps the oldest queued copy. With the render loop calling `sync` before
//! `stage`, the slot mapped in cycle k is the one filled in cycle k-1 while the
//! copy issued in cycle k lands in a different slot.

use std::{collections::VecDeque, sync::Arc, time::Instant};

use tracing::{debug, trace_span};

use crate::{
    error::PipelineError,
    gpu::{GraphicsBackend, TextureDesc},
};

/// Minimum number of slots required to overlap copy and consumption.
pub const MIN_STAGING_SLOTS: usize = 2;

pub struct AsyncStagingReader<B: GraphicsBackend> {
    label: &'static str,
    desc: TextureDesc,
    slots: Vec<B::Staging>,
    pending: VecDeque<usize>,
    cursor: usize,
    buffer: Arc<Vec<u8>>,
}

impl<B: GraphicsBackend> AsyncStagingReader<B> {
    /// Allocate `slot_count` staging surfaces of `desc`.
    pub fn new(
        backend: &mut B,
        label: &'static str,
        desc: TextureDesc,
        slot_count: usize,
    ) -> Result<Self, PipelineError> {
        if slot_count < MIN_STAGING_SLOTS {
            return Err(PipelineError::Config(format!(
                "{label}: staging ring needs at least {MIN_STAGING_SLOTS} slots, got {slot_count}"
            )));
        }
        let slots = (0..slot_count)
            .map(|_| backend.create_staging(desc))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            label,
            desc,
            slots,
            pending: VecDeque::with_capacity(slot_count),
            cursor: 0,
            buffer: Arc::new(vec![0u8; desc.byte_len()]),
        })
    }

    /// Queue a copy of `texture` into the next slot in rotation.
    ///
    /// A texture whose size or format differs from the reader's is a
    /// configuration error; the reader must be rebuilt for new dimensions.
    pub fn stage(&mut self, backend: &mut B, texture: &B::Texture) -> Result<(), PipelineError> {
        let got = backend.texture_desc(texture);
        if got != self.desc {
            return Err(PipelineError::StagingMismatch {
                expected: self.desc,
                got,
            });
        }

        if self.pending.len() == self.slots.len() {
            // Every slot holds an unread copy; the oldest gets overwritten.
            if let Some(dropped) = self.pending.pop_front() {
                debug!(reader = self.label, slot = dropped, "staging ring full, dropping oldest copy");
            }
        }

        let slot = self.cursor;
        backend.copy_to_staging(texture, &mut self.slots[slot])?;
        self.pending.push_back(slot);
        self.cursor = (self.cursor + 1) % self.slots.len();
        Ok(())
    }

    /// Map the oldest pending copy into the CPU buffer.
    ///
    /// Returns `Ok(false)` when no copy is pending, leaving the buffer as is.
    pub fn sync(&mut self, backend: &mut B) -> Result<bool, PipelineError> {
        let Some(slot) = self.pending.pop_front() else {
            return Ok(false);
        };
        let _span = trace_span!("staging.sync", reader = self.label, slot).entered();
        let started = Instant::now();

        // Task closures may still hold the previous buffer; never write under them.
        if Arc::strong_count(&self.buffer) > 1 {
            self.buffer = Arc::new(vec![0u8; self.desc.byte_len()]);
        }
        let out = Arc::make_mut(&mut self.buffer);
        backend.map_staging_for_read(&mut self.slots[slot], out)?;

        metrics::histogram!("vision_stage_latency_seconds", "stage" => "staging_sync")
            .record(started.elapsed().as_secs_f64());
        Ok(true)
    }

    /// CPU copy produced by the last successful [`sync`](Self::sync).
    pub fn buffer(&self) -> &Arc<Vec<u8>> {
        &self.buffer
    }

    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
