// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical memory: frame contents plus the copy and zero-fill primitives.
//!
//! Frames are locked individually. A frame is only touched by whoever the
//! coremap says owns it, so the per-frame lock never contends in practice; it
//! exists so a demand-load can fill a frame outside any critical section.

use alloc::{boxed::Box, vec::Vec};

use spin::Mutex;

use super::{FrameNumber, PAGE_SIZE};

type Frame = [u8; PAGE_SIZE];

pub(crate) struct PhysMem {
    frames: Vec<Mutex<Box<Frame>>>,
}

impl PhysMem {
    pub(crate) fn new(frames: usize) -> Self {
        Self { frames: (0..frames).map(|_| Mutex::new(Box::new([0u8; PAGE_SIZE]))).collect() }
    }

    fn frame(&self, frame: FrameNumber) -> &Mutex<Box<Frame>> {
        match self.frames.get(frame.index()) {
            Some(slot) => slot,
            None => kfatal!("phys: frame {} beyond end of memory", frame.0),
        }
    }

    /// Clears an entire frame.
    pub(crate) fn zero(&self, frame: FrameNumber) {
        self.frame(frame).lock().fill(0);
    }

    /// Duplicates the contents of `src` into `dst`.
    pub(crate) fn copy_frame(&self, src: FrameNumber, dst: FrameNumber) {
        if src == dst {
            return;
        }
        let data = **self.frame(src).lock();
        **self.frame(dst).lock() = data;
    }

    /// Runs `f` over the frame's bytes.
    pub(crate) fn with_frame<R>(&self, frame: FrameNumber, f: impl FnOnce(&mut Frame) -> R) -> R {
        let mut guard = self.frame(frame).lock();
        f(&mut guard)
    }

    pub(crate) fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]) {
        self.with_frame(frame, |bytes| buf.copy_from_slice(&bytes[offset..offset + buf.len()]));
    }

    pub(crate) fn write(&self, frame: FrameNumber, offset: usize, data: &[u8]) {
        self.with_frame(frame, |bytes| bytes[offset..offset + data.len()].copy_from_slice(data));
    }
}
