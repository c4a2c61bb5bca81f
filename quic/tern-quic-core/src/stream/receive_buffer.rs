// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reassembly buffer for received stream data.
//!
//! Storage is a ring of fixed-size blocks allocated lazily and retired as
//! soon as their last byte is consumed. Received ranges are tracked in an
//! interval set whose size is bounded: a peer spraying tiny disjoint
//! fragments cannot make gap tracking unbounded.

use crate::{
    interval_set::IntervalSet,
    transport::error::{Code, Error},
};

/// Size of a storage block
pub const BLOCK_SIZE_BYTES: usize = 8 * 1024;

/// The largest packet-number gap the connection accepts before declaring
/// the peer broken; gap tracking is sized from it
const MAX_PACKET_GAP: usize = 5000;

/// Upper limit of gaps in the buffer, which bounds the iterations needed
/// to find the right gap when a frame arrives
const MAX_NUM_DATA_INTERVALS_ALLOWED: usize = 2 * MAX_PACKET_GAP;

type BufferBlock = Box<[u8; BLOCK_SIZE_BYTES]>;

#[derive(Debug)]
pub struct ReceiveBuffer {
    max_buffer_capacity_bytes: u64,
    blocks_count: usize,
    /// Lazily allocated storage ring; `None` slots hold no data
    blocks: Vec<Option<BufferBlock>>,
    total_bytes_read: u64,
    num_bytes_buffered: u64,
    bytes_received: IntervalSet,
}

impl ReceiveBuffer {
    /// Creates a buffer able to hold `max_capacity_bytes`, the negotiated
    /// flow-control receive window limit
    pub fn new(max_capacity_bytes: u64) -> Self {
        debug_assert!(max_capacity_bytes > 0);
        let blocks_count = max_capacity_bytes.div_ceil(BLOCK_SIZE_BYTES as u64) as usize;
        Self {
            max_buffer_capacity_bytes: max_capacity_bytes,
            blocks_count,
            blocks: Vec::new(),
            total_bytes_read: 0,
            num_bytes_buffered: 0,
            bytes_received: IntervalSet::new(),
        }
    }

    /// Total contiguous bytes the application has consumed
    #[inline]
    pub fn bytes_consumed(&self) -> u64 {
        self.total_bytes_read
    }

    /// Bytes currently stored, contiguous or not
    #[inline]
    pub fn bytes_buffered(&self) -> u64 {
        self.num_bytes_buffered
    }

    /// The first byte that has not been received yet
    pub fn first_missing_byte(&self) -> u64 {
        match self.bytes_received.first() {
            Some(first) if first.start == 0 => first.end,
            // Offset 0 is not received yet.
            _ => 0,
        }
    }

    /// One past the highest received byte
    pub fn next_expected_byte(&self) -> u64 {
        self.bytes_received.last().map_or(0, |last| last.end)
    }

    /// Contiguous bytes available for reading
    #[inline]
    pub fn readable_bytes(&self) -> u64 {
        self.first_missing_byte() - self.total_bytes_read
    }

    #[inline]
    pub fn has_bytes_to_read(&self) -> bool {
        self.readable_bytes() > 0
    }

    fn is_empty(&self) -> bool {
        // Empty means every received byte has been read.
        match self.bytes_received.first() {
            None => true,
            Some(first) => {
                self.bytes_received.interval_len() == 1
                    && self.total_bytes_read > 0
                    && first.end == self.total_bytes_read
            }
        }
    }

    /// Buffers `data` starting at the absolute `starting_offset`.
    ///
    /// Returns the number of previously-unreceived bytes buffered. Empty
    /// frames, writes beyond the window, and gap-tracking exhaustion are
    /// connection-fatal.
    pub fn on_stream_data(&mut self, starting_offset: u64, data: &[u8]) -> Result<u64, Error> {
        let size = data.len() as u64;
        if size == 0 {
            return Err(Error::new(Code::EmptyStreamFrameNoFin)
                .with_reason("Received empty stream frame without FIN"));
        }
        // Writes beyond the current window the buffer is covering.
        let end_offset = match starting_offset.checked_add(size) {
            Some(end) => end,
            None => {
                return Err(Error::new(Code::InternalError)
                    .with_reason("Received data beyond available range"));
            }
        };
        if end_offset > self.total_bytes_read + self.max_buffer_capacity_bytes {
            return Err(Error::new(Code::InternalError)
                .with_reason("Received data beyond available range"));
        }

        let range = starting_offset..end_offset;
        let after_all_received = self
            .bytes_received
            .last()
            .map_or(true, |last| range.start >= last.end);
        if after_all_received || self.bytes_received.is_disjoint(&range) {
            // Typical case: all data is newly received.
            self.bytes_received.insert_optimized_for_append(range.clone());
            if self.bytes_received.interval_len() >= MAX_NUM_DATA_INTERVALS_ALLOWED {
                return Err(Error::new(Code::TooManyStreamDataIntervals)
                    .with_reason("Too many data intervals received for this stream"));
            }
            self.copy_stream_data(starting_offset, data)?;
            self.num_bytes_buffered += size;
            return Ok(size);
        }

        // Slow path: the data overlaps previously received ranges.
        let newly_received = self.bytes_received.difference_of(range.clone());
        if newly_received.is_empty() {
            return Ok(0);
        }
        self.bytes_received.insert(range);
        if self.bytes_received.interval_len() >= MAX_NUM_DATA_INTERVALS_ALLOWED {
            return Err(Error::new(Code::TooManyStreamDataIntervals)
                .with_reason("Too many data intervals received for this stream"));
        }
        let mut bytes_buffered = 0;
        for interval in newly_received {
            let copy_offset = interval.start;
            let copy_length = interval.end - interval.start;
            let source_start = (copy_offset - starting_offset) as usize;
            self.copy_stream_data(
                copy_offset,
                &data[source_start..source_start + copy_length as usize],
            )?;
            bytes_buffered += copy_length;
        }
        self.num_bytes_buffered += bytes_buffered;
        Ok(bytes_buffered)
    }

    /// Writes `data` block by block, allocating blocks on first touch
    fn copy_stream_data(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let mut source = data;
        let mut offset = offset;

        if self.blocks.is_empty() {
            self.blocks = (0..self.blocks_count).map(|_| None).collect();
        }

        while !source.is_empty() {
            let write_block_num = self.block_index(offset);
            let write_block_offset = self.in_block_offset(offset);
            debug_assert!(write_block_num < self.blocks_count);

            let mut bytes_avail = self.block_capacity(write_block_num) - write_block_offset;
            // A write meeting the upper boundary of the buffer reduces the
            // available free bytes.
            let boundary = self.total_bytes_read + self.max_buffer_capacity_bytes;
            if offset + bytes_avail as u64 > boundary {
                bytes_avail = (boundary - offset) as usize;
            }

            let Some(slot) = self.blocks.get_mut(write_block_num) else {
                return Err(Error::new(Code::InternalError)
                    .with_reason("write exceeds the block array bounds"));
            };
            let block = slot.get_or_insert_with(|| Box::new([0u8; BLOCK_SIZE_BYTES]));

            let bytes_to_copy = bytes_avail.min(source.len());
            block[write_block_offset..write_block_offset + bytes_to_copy]
                .copy_from_slice(&source[..bytes_to_copy]);
            source = &source[bytes_to_copy..];
            offset += bytes_to_copy as u64;
        }
        Ok(())
    }

    /// Reads contiguous data into `dest`, retiring drained blocks.
    /// Returns the number of bytes read.
    pub fn read(&mut self, dest: &mut [u8]) -> Result<u64, Error> {
        let mut bytes_read = 0u64;
        let mut dest_remaining = dest.len() as u64;

        while dest_remaining > 0 && self.readable_bytes() > 0 {
            let block_idx = self.next_block_to_read();
            let start_offset_in_block = self.read_offset();
            let block_capacity = self.block_capacity(block_idx);
            let bytes_available_in_block = self
                .readable_bytes()
                .min((block_capacity - start_offset_in_block) as u64);
            let bytes_to_copy = bytes_available_in_block.min(dest_remaining);
            debug_assert!(bytes_to_copy > 0);

            let Some(Some(block)) = self.blocks.get(block_idx) else {
                return Err(Error::new(Code::InternalError)
                    .with_reason("read from a block that was never written"));
            };
            let dest_start = (dest.len() as u64 - dest_remaining) as usize;
            dest[dest_start..dest_start + bytes_to_copy as usize].copy_from_slice(
                &block[start_offset_in_block..start_offset_in_block + bytes_to_copy as usize],
            );
            dest_remaining -= bytes_to_copy;
            self.num_bytes_buffered -= bytes_to_copy;
            self.total_bytes_read += bytes_to_copy;
            bytes_read += bytes_to_copy;

            // Retire the block if every byte was drained and no wrapped or
            // out-of-order data still needs it.
            if bytes_to_copy == bytes_available_in_block {
                self.retire_block_if_empty(block_idx)?;
            }
        }
        Ok(bytes_read)
    }

    /// Borrows the contiguous readable regions without copying
    pub fn get_readable_regions(&self) -> Vec<&[u8]> {
        let mut regions = Vec::new();
        if self.readable_bytes() == 0 {
            return regions;
        }

        let mut offset = self.total_bytes_read;
        let end = self.first_missing_byte();
        while offset < end {
            let block_idx = self.block_index(offset);
            let block_offset = self.in_block_offset(offset);
            let available_in_block =
                ((self.block_capacity(block_idx) - block_offset) as u64).min(end - offset);
            let Some(Some(block)) = self.blocks.get(block_idx) else {
                break;
            };
            regions.push(&block[block_offset..block_offset + available_in_block as usize]);
            offset += available_in_block;
        }
        regions
    }

    /// Borrows the longest region starting at the read cursor
    pub fn get_readable_region(&self) -> Option<&[u8]> {
        self.get_readable_regions().into_iter().next()
    }

    /// Inspects received data at `offset` without consuming it. The region
    /// may be shorter than the received run if it crosses a block boundary.
    pub fn peek_region(&self, offset: u64) -> Option<&[u8]> {
        if offset < self.total_bytes_read {
            // Already consumed.
            return None;
        }
        if offset >= self.first_missing_byte() {
            // Not received yet.
            return None;
        }
        let block_idx = self.block_index(offset);
        let block_offset = self.in_block_offset(offset);
        let block = self.blocks.get(block_idx)?.as_ref()?;

        let end = self.first_missing_byte();
        let end_block_idx = self.block_index(end);
        let len = if block_idx == end_block_idx {
            self.in_block_offset(end) - block_offset
        } else {
            self.block_capacity(block_idx) - block_offset
        };
        Some(&block[block_offset..block_offset + len])
    }

    /// Advances the read cursor by `bytes_used` without copying out.
    /// Returns false if fewer bytes are readable.
    pub fn mark_consumed(&mut self, bytes_used: u64) -> bool {
        if bytes_used > self.readable_bytes() {
            return false;
        }
        let mut bytes_to_consume = bytes_used;
        while bytes_to_consume > 0 {
            let block_idx = self.next_block_to_read();
            let offset_in_block = self.read_offset();
            let bytes_available = self
                .readable_bytes()
                .min((self.block_capacity(block_idx) - offset_in_block) as u64);
            let bytes_read = bytes_to_consume.min(bytes_available);
            self.total_bytes_read += bytes_read;
            self.num_bytes_buffered -= bytes_read;
            bytes_to_consume -= bytes_read;
            if bytes_available == bytes_read {
                let _ = self.retire_block_if_empty(block_idx);
            }
        }
        true
    }

    /// Discards all buffered-but-unread data, advancing the read cursor to
    /// the end of everything received. Returns the number of bytes skipped.
    pub fn flush_buffered_frames(&mut self) -> u64 {
        let prev_total_bytes_read = self.total_bytes_read;
        self.total_bytes_read = self.next_expected_byte();
        self.clear();
        self.total_bytes_read - prev_total_bytes_read
    }

    /// Releases every block, keeping only the read cursor
    pub fn release_whole_buffer(&mut self) {
        self.clear();
        self.blocks = Vec::new();
    }

    fn clear(&mut self) {
        for slot in &mut self.blocks {
            *slot = None;
        }
        self.num_bytes_buffered = 0;
        self.bytes_received.clear();
        self.bytes_received.insert(0..self.total_bytes_read);
    }

    fn block_index(&self, offset: u64) -> usize {
        ((offset % self.max_buffer_capacity_bytes) as usize) / BLOCK_SIZE_BYTES
    }

    fn in_block_offset(&self, offset: u64) -> usize {
        ((offset % self.max_buffer_capacity_bytes) as usize) % BLOCK_SIZE_BYTES
    }

    fn read_offset(&self) -> usize {
        self.in_block_offset(self.total_bytes_read)
    }

    fn next_block_to_read(&self) -> usize {
        self.block_index(self.total_bytes_read)
    }

    /// The last block of the ring may be shorter than a full block
    fn block_capacity(&self, block_index: usize) -> usize {
        if block_index + 1 == self.blocks_count {
            let remainder = (self.max_buffer_capacity_bytes as usize) % BLOCK_SIZE_BYTES;
            if remainder == 0 {
                BLOCK_SIZE_BYTES
            } else {
                remainder
            }
        } else {
            BLOCK_SIZE_BYTES
        }
    }

    fn retire_block_if_empty(&mut self, block_index: usize) -> Result<(), Error> {
        debug_assert!(
            self.readable_bytes() == 0 || self.read_offset() == 0,
            "retire_block_if_empty called while the read cursor is mid-block"
        );
        // The whole buffer drained: the last piece of data has been read.
        if self.is_empty() {
            return self.retire_block(block_index);
        }

        // Not empty if the logical end of the buffer has wrapped into this
        // block.
        if self.block_index(self.next_expected_byte() - 1) == block_index {
            return Ok(());
        }

        // The read cursor stopped in this block, meaning a gap was reached.
        if self.next_block_to_read() == block_index {
            if self.bytes_received.interval_len() > 1 {
                let second = self.bytes_received.iter().nth(1);
                if let Some(second) = second {
                    if self.block_index(second.start) == block_index {
                        // The next data interval lives here; keep the block.
                        return Ok(());
                    }
                }
            } else {
                return Err(Error::new(Code::InternalError)
                    .with_reason("read stopped where it should not have"));
            }
        }
        self.retire_block(block_index)
    }

    fn retire_block(&mut self, block_index: usize) -> Result<(), Error> {
        let Some(slot) = self.blocks.get_mut(block_index) else {
            return Err(Error::new(Code::InternalError).with_reason("retired an unknown block"));
        };
        if slot.is_none() {
            return Err(Error::new(Code::InternalError).with_reason("tried to retire block twice"));
        }
        *slot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn in_order_data_is_readable() {
        let mut buffer = ReceiveBuffer::new(64 * 1024);
        let data = payload(1000, 1);
        assert_eq!(buffer.on_stream_data(0, &data).unwrap(), 1000);
        assert_eq!(buffer.readable_bytes(), 1000);
        assert_eq!(buffer.bytes_buffered(), 1000);

        let mut out = vec![0u8; 1000];
        assert_eq!(buffer.read(&mut out).unwrap(), 1000);
        assert_eq!(out, data);
        assert_eq!(buffer.bytes_consumed(), 1000);
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn out_of_order_data_waits_for_the_gap() {
        let mut buffer = ReceiveBuffer::new(64 * 1024);
        buffer.on_stream_data(1000, &payload(1000, 2)).unwrap();
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.bytes_buffered(), 1000);

        // the gap fills; everything becomes readable
        buffer.on_stream_data(0, &payload(1000, 1)).unwrap();
        assert_eq!(buffer.readable_bytes(), 2000);
    }

    #[test]
    fn overlapping_data_buffers_only_new_bytes() {
        let mut buffer = ReceiveBuffer::new(64 * 1024);
        assert_eq!(buffer.on_stream_data(0, &payload(1000, 1)).unwrap(), 1000);
        // complete overlap
        assert_eq!(buffer.on_stream_data(0, &payload(1000, 1)).unwrap(), 0);
        // partial overlap
        assert_eq!(buffer.on_stream_data(500, &payload(1000, 1)).unwrap(), 500);
        assert_eq!(buffer.bytes_buffered(), 1500);
    }

    #[test]
    fn empty_frame_is_fatal() {
        let mut buffer = ReceiveBuffer::new(64 * 1024);
        let error = buffer.on_stream_data(0, &[]).unwrap_err();
        assert_eq!(error.code, Code::EmptyStreamFrameNoFin);
    }

    #[test]
    fn data_beyond_capacity_is_fatal() {
        let mut buffer = ReceiveBuffer::new(4096);
        let error = buffer.on_stream_data(4096, &payload(1, 0)).unwrap_err();
        assert_eq!(error.code, Code::InternalError);

        // consuming data slides the window forward
        buffer.on_stream_data(0, &payload(4096, 0)).unwrap();
        let mut out = vec![0u8; 4096];
        buffer.read(&mut out).unwrap();
        assert_eq!(buffer.on_stream_data(4096, &payload(1, 0)).unwrap(), 1);
    }

    #[test]
    fn mark_consumed_advances_exactly() {
        let mut buffer = ReceiveBuffer::new(64 * 1024);
        buffer.on_stream_data(0, &payload(1000, 1)).unwrap();

        assert!(buffer.mark_consumed(400));
        assert_eq!(buffer.bytes_consumed(), 400);
        assert_eq!(buffer.readable_bytes(), 600);

        // consuming more than is readable fails and changes nothing
        assert!(!buffer.mark_consumed(601));
        assert_eq!(buffer.bytes_consumed(), 400);

        assert!(buffer.mark_consumed(600));
        assert_eq!(buffer.bytes_consumed(), 1000);
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn readable_regions_do_not_copy() {
        let mut buffer = ReceiveBuffer::new(64 * 1024);
        // span two blocks
        let data = payload(BLOCK_SIZE_BYTES + 100, 7);
        buffer.on_stream_data(0, &data).unwrap();

        let regions = buffer.get_readable_regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].len(), BLOCK_SIZE_BYTES);
        assert_eq!(regions[1].len(), 100);
        assert_eq!(regions[0], &data[..BLOCK_SIZE_BYTES]);
        assert_eq!(regions[1], &data[BLOCK_SIZE_BYTES..]);
    }

    #[test]
    fn peek_region_allows_out_of_band_inspection() {
        let mut buffer = ReceiveBuffer::new(64 * 1024);
        let data = payload(1000, 3);
        buffer.on_stream_data(0, &data).unwrap();

        let region = buffer.peek_region(200).unwrap();
        assert_eq!(region, &data[200..]);

        // peeking consumed or missing data fails
        buffer.mark_consumed(500);
        assert!(buffer.peek_region(200).is_none());
        assert!(buffer.peek_region(1000).is_none());
    }

    #[test]
    fn blocks_are_retired_after_reading() {
        let mut buffer = ReceiveBuffer::new(4 * BLOCK_SIZE_BYTES as u64);
        let data = payload(2 * BLOCK_SIZE_BYTES, 5);
        buffer.on_stream_data(0, &data).unwrap();
        assert!(buffer.blocks[0].is_some());
        assert!(buffer.blocks[1].is_some());

        let mut out = vec![0u8; 2 * BLOCK_SIZE_BYTES];
        buffer.read(&mut out).unwrap();
        assert!(buffer.blocks[0].is_none());
        assert!(buffer.blocks[1].is_none());

        // the ring wraps: offsets past capacity reuse block 0
        let wrap_offset = 4 * BLOCK_SIZE_BYTES as u64;
        buffer
            .on_stream_data(wrap_offset, &payload(100, 9))
            .unwrap();
        assert!(buffer.blocks[0].is_some());
    }

    #[test]
    fn flush_buffered_frames_skips_pending_data() {
        let mut buffer = ReceiveBuffer::new(64 * 1024);
        buffer.on_stream_data(0, &payload(1000, 1)).unwrap();
        buffer.on_stream_data(2000, &payload(1000, 2)).unwrap();
        buffer.mark_consumed(500);

        // everything received (through the gap) is skipped
        assert_eq!(buffer.flush_buffered_frames(), 2500);
        assert_eq!(buffer.bytes_consumed(), 3000);
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.bytes_buffered(), 0);
    }

    #[test]
    fn gap_tracking_is_bounded() {
        let mut buffer = ReceiveBuffer::new(10 * 1024 * 1024);
        // every other byte creates a new interval
        let mut result = Ok(0);
        for i in 0..MAX_NUM_DATA_INTERVALS_ALLOWED as u64 + 1 {
            result = buffer.on_stream_data(i * 2, &[0u8]);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err().code, Code::TooManyStreamDataIntervals);
    }
}
