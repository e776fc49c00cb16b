use log::{debug, trace};

use crate::bitwriter::BitWriter;
use crate::error::AecError;
use crate::extract::SampleFormat;
use crate::params::{AecFlags, AecParams};
use crate::preprocess::{preprocess_signed, preprocess_unsigned};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Like `AEC_NO_FLUSH`: encoding may continue once more input is provided.
    NoFlush,
    /// Like `AEC_FLUSH`: the caller asserts no more input will be provided.
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    /// More input is required to make progress.
    NeedInput,
    /// The output buffer was filled; provide more output space to continue.
    NeedOutput,
    /// A requested flush completed; the stream is final.
    Finished,
}

/// Sentinel run length: the zero-block run reaches a 64-block segment
/// boundary (or the RSI end) and is emitted as the Run-Of-Segments escape.
const ROS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    GetBlock,
    GetRsiResumable,
    CheckZeroBlock,
    SelectCodeOption,
    EncodeSplitting,
    EncodeUncomp,
    EncodeSe,
    EncodeZero,
    FlushBlock,
    FlushBlockResumable,
}

enum Step {
    Continue,
    Exit(EncodeStatus),
}

/// Byte queue for pushed input, compacted after each `encode` call.
#[derive(Debug, Clone)]
struct InputQueue {
    buf: Vec<u8>,
    pos: usize,
}

impl InputQueue {
    fn new() -> Self {
        Self { buf: Vec::new(), pos: 0 }
    }

    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn avail(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> &[u8] {
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        s
    }

    fn compact(&mut self) -> usize {
        let n = self.pos;
        if n > 0 {
            self.buf.drain(..n);
            self.pos = 0;
        }
        n
    }
}

struct Ctx<'a> {
    out: &'a mut [u8],
    written: usize,
}

impl Ctx<'_> {
    fn avail(&self) -> usize {
        self.out.len() - self.written
    }
}

/// Streaming AEC encoder (Rust-idiomatic, modeled after libaec's `aec_stream`).
///
/// This type allows chunked input and chunked output:
///
/// - call [`Encoder::push_input`] to append raw sample bytes
/// - call [`Encoder::encode`] to write coded bytes into a caller buffer
///
/// The encoder yields when it runs out of input (`NeedInput`) or output
/// space (`NeedOutput`); splitting the same data into arbitrarily small
/// pieces produces a byte-identical stream. Passing [`Flush::Flush`] tells
/// the encoder the input is complete: it pads the final reference sample
/// interval, drains the bit writer, and reports `Finished`.
pub struct Encoder {
    params: AecParams,
    fmt: SampleFormat,
    bytes_per_sample: usize,
    id_len: u32,
    kmax: u32,
    /// Largest representable sample in the unsigned interpretation.
    xmax: u32,
    rsi_len: usize,
    cds_len: usize,
    preprocess: bool,

    input: InputQueue,
    data_raw: Vec<u32>,
    data_pp: Vec<u32>,

    mode: Mode,
    flush: Flush,
    flush_requested: bool,
    flushed: bool,

    block_start: usize,
    /// Blocks of the current RSI still to encode after the current one.
    blocks_avail: u32,
    /// Blocks actually present in the current RSI (== rsi except for a
    /// padded final interval).
    rsi_blocks: u32,
    block_nonzero: bool,
    ref_block: bool,
    ref_sample: u32,
    /// Bits an uncompressed rendition of the current block would take.
    uncomp_len: u32,
    /// Splitting parameter of the previous block, seed for the next search.
    k: u32,

    zero_blocks: u32,
    zero_ref: bool,
    zero_ref_sample: u32,

    writer: BitWriter,
    staging: Vec<u8>,
    direct: bool,

    /// Resumable cursor: next sample index during RSI ingest, next byte
    /// index while draining the staging buffer.
    i: usize,

    total_in: usize,
    total_out: usize,
}

fn validate_params(params: &AecParams) -> Result<(), AecError> {
    if !(1..=32).contains(&params.bits_per_sample) {
        return Err(AecError::InvalidConfig("bits_per_sample must be 1..=32"));
    }
    if ![8u32, 16, 32, 64].contains(&params.block_size) {
        return Err(AecError::Unsupported("block_size must be one of 8,16,32,64"));
    }
    if !(1..=4096).contains(&params.rsi) {
        return Err(AecError::InvalidConfig("rsi must be 1..=4096"));
    }
    if params.flags.contains(AecFlags::RESTRICTED) && (5..=8).contains(&params.bits_per_sample) {
        return Err(AecError::InvalidConfig("restricted coding requires bits_per_sample <= 4"));
    }
    Ok(())
}

fn id_len(params: &AecParams) -> u32 {
    let bps = params.bits_per_sample;

    if params.flags.contains(AecFlags::RESTRICTED) && bps <= 4 {
        if bps <= 2 { 1 } else { 2 }
    } else if bps > 16 {
        5
    } else if bps > 8 {
        4
    } else {
        3
    }
}

impl Encoder {
    pub fn new(params: AecParams) -> Result<Self, AecError> {
        validate_params(&params)?;

        let fmt = SampleFormat::select(&params);
        let bytes_per_sample = fmt.bytes();
        let id_len = id_len(&params);
        let kmax = if id_len > 1 { (1u32 << id_len) - 3 } else { 0 };
        let bps = params.bits_per_sample as u32;
        let xmax = (((1u64 << bps) - 1) & 0xffff_ffff) as u32;

        let n_samples = (params.rsi * params.block_size) as usize;
        let rsi_len = n_samples * bytes_per_sample;
        let preprocess = params.flags.contains(AecFlags::DATA_PREPROCESS);

        // Worst single-block CDS: option ID plus sentinel bit, a literal
        // reference sample, and the larger of an uncompressed block or a
        // zero-run code; extra bytes absorb the carried partial byte and
        // byte-boundary normalization.
        let worst_bits = id_len + 1 + bps + (params.block_size * bps).max(66);
        let cds_len = worst_bits.div_ceil(8) as usize + 3;

        debug!(
            "aec encoder: bps={bps} block_size={} rsi={} flags={:?} id_len={id_len} \
             kmax={kmax} bytes/sample={bytes_per_sample} cds_len={cds_len}",
            params.block_size, params.rsi, params.flags
        );

        Ok(Self {
            params,
            fmt,
            bytes_per_sample,
            id_len,
            kmax,
            xmax,
            rsi_len,
            cds_len,
            preprocess,
            input: InputQueue::new(),
            data_raw: if preprocess { vec![0; n_samples] } else { Vec::new() },
            data_pp: vec![0; n_samples],
            mode: Mode::GetBlock,
            flush: Flush::NoFlush,
            flush_requested: false,
            flushed: false,
            block_start: 0,
            blocks_avail: 0,
            rsi_blocks: params.rsi,
            block_nonzero: false,
            ref_block: false,
            ref_sample: 0,
            uncomp_len: params.block_size * bps,
            k: 0,
            zero_blocks: 0,
            zero_ref: false,
            zero_ref_sample: 0,
            writer: BitWriter::new(),
            staging: vec![0; cds_len],
            direct: false,
            i: 0,
            total_in: 0,
            total_out: 0,
        })
    }

    /// Append raw sample bytes to the input queue.
    pub fn push_input(&mut self, input: &[u8]) {
        self.input.push(input);
    }

    /// Total number of input bytes consumed so far.
    pub fn total_in(&self) -> usize {
        self.total_in
    }

    /// Total number of output bytes produced so far.
    pub fn total_out(&self) -> usize {
        self.total_out
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn avail_in(&self) -> usize {
        self.input.avail()
    }

    /// True once a flush has fully drained the stream.
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Run the encoder until it yields; returns (bytes written, status).
    pub fn encode(&mut self, out: &mut [u8], flush: Flush) -> (usize, EncodeStatus) {
        if self.flushed {
            return (0, EncodeStatus::Finished);
        }
        self.flush = flush;
        if flush == Flush::Flush {
            self.flush_requested = true;
        }

        let mut ctx = Ctx { out, written: 0 };
        let status = loop {
            let step = match self.mode {
                Mode::GetBlock => self.m_get_block(&mut ctx),
                Mode::GetRsiResumable => self.m_get_rsi_resumable(&mut ctx),
                Mode::CheckZeroBlock => self.m_check_zero_block(),
                Mode::SelectCodeOption => self.m_select_code_option(),
                Mode::EncodeSplitting => self.m_encode_splitting(&mut ctx),
                Mode::EncodeUncomp => self.m_encode_uncomp(&mut ctx),
                Mode::EncodeSe => self.m_encode_se(&mut ctx),
                Mode::EncodeZero => self.m_encode_zero(&mut ctx),
                Mode::FlushBlock => self.m_flush_block(&mut ctx),
                Mode::FlushBlockResumable => self.m_flush_block_resumable(&mut ctx),
            };
            if let Step::Exit(status) = step {
                break status;
            }
        };

        if self.direct {
            // Hand the completed bytes to the caller and park the partial
            // byte in the staging buffer for the next call.
            ctx.written = self.writer.pos;
            self.staging[0] = ctx.out[self.writer.pos];
            self.writer.pos = 0;
            self.direct = false;
        }

        self.total_in += self.input.compact();
        self.total_out += ctx.written;
        (ctx.written, status)
    }

    /// Tear down the session.
    ///
    /// Returns an error if a flush was requested but the stream never
    /// reported [`EncodeStatus::Finished`] (coded bytes are still pending).
    pub fn finish(self) -> Result<(), AecError> {
        if self.flush_requested && !self.flushed {
            return Err(AecError::IncompleteFlush { total_out: self.total_out });
        }
        Ok(())
    }

    fn active_byte(&self, ctx: &Ctx<'_>) -> u8 {
        if self.direct { ctx.out[self.writer.pos] } else { self.staging[self.writer.pos] }
    }

    fn m_get_block(&mut self, ctx: &mut Ctx<'_>) -> Step {
        // Output staging: go direct when a worst-case block fits in the
        // caller's buffer, otherwise emit into the staging buffer. Either
        // way the partial byte carries over bit-exactly.
        if ctx.avail() > self.cds_len {
            if !self.direct {
                ctx.out[ctx.written] = self.staging[self.writer.pos];
                self.writer.pos = ctx.written;
                self.direct = true;
            }
        } else {
            let partial = self.active_byte(ctx);
            self.staging[0] = partial;
            self.writer.pos = 0;
            self.direct = false;
        }

        if self.block_nonzero {
            // A non-zero block was deferred while a zero run was flushed.
            self.block_nonzero = false;
            self.mode = Mode::SelectCodeOption;
            return Step::Continue;
        }

        if self.blocks_avail == 0 {
            self.blocks_avail = self.params.rsi - 1;
            self.rsi_blocks = self.params.rsi;
            self.block_start = 0;

            if self.input.avail() >= self.rsi_len {
                trace!("new rsi ({} samples, fast path)", self.data_pp.len());
                self.ingest_rsi();
                self.mode = Mode::CheckZeroBlock;
            } else {
                self.i = 0;
                self.mode = Mode::GetRsiResumable;
            }
        } else {
            self.block_start += self.params.block_size as usize;
            self.blocks_avail -= 1;
            if self.ref_block {
                self.ref_block = false;
                self.uncomp_len = self.params.block_size * self.params.bits_per_sample as u32;
            }
            self.mode = Mode::CheckZeroBlock;
        }
        Step::Continue
    }

    fn ingest_rsi(&mut self) {
        let n = self.rsi_len;
        let fmt = self.fmt;
        let pre = self.preprocess;

        let Self { input, data_raw, data_pp, .. } = self;
        let src = &input.buf[input.pos..input.pos + n];
        let dst = if pre { &mut data_raw[..] } else { &mut data_pp[..] };
        fmt.get_many(src, dst);
        input.pos += n;

        if pre {
            self.run_preprocess();
        }
    }

    fn run_preprocess(&mut self) {
        if self.params.flags.contains(AecFlags::DATA_SIGNED) {
            preprocess_signed(&self.data_raw, &mut self.data_pp, self.params.bits_per_sample);
        } else {
            preprocess_unsigned(&self.data_raw, &mut self.data_pp, self.xmax);
        }

        // Lift the reference sample out of the residual buffer: slot 0 takes
        // part in second-extension pairing and the zero scan as a zero, and
        // the literal value is emitted separately.
        self.ref_block = true;
        self.uncomp_len = (self.params.block_size - 1) * self.params.bits_per_sample as u32;
        self.ref_sample = self.data_pp[0] & self.xmax;
        self.data_pp[0] = 0;
    }

    fn m_get_rsi_resumable(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let n_samples = self.data_pp.len();
        let bs = self.params.block_size as usize;

        loop {
            if self.input.avail() >= self.bytes_per_sample {
                let fmt = self.fmt;
                let n = self.bytes_per_sample;
                let v = fmt.get(self.input.take(n));
                if self.preprocess {
                    self.data_raw[self.i] = v;
                } else {
                    self.data_pp[self.i] = v;
                }
                self.i += 1;
                if self.i == n_samples {
                    if self.preprocess {
                        self.run_preprocess();
                    }
                    self.mode = Mode::CheckZeroBlock;
                    return Step::Continue;
                }
            } else if self.flush == Flush::Flush {
                if self.i > 0 {
                    // Pad the trailing partial block with its last sample.
                    let mut present = (self.i / bs) as u32;
                    if self.i % bs != 0 {
                        present += 1;
                    }
                    self.blocks_avail = present - 1;
                    self.rsi_blocks = present;

                    let dst = if self.preprocess { &mut self.data_raw } else { &mut self.data_pp };
                    while self.i % bs != 0 {
                        dst[self.i] = dst[self.i - 1];
                        self.i += 1;
                    }

                    if self.preprocess {
                        self.run_preprocess();
                    }
                    trace!("final rsi padded to {present} blocks");
                    self.mode = Mode::CheckZeroBlock;
                    return Step::Continue;
                }
                return self.finalize(ctx);
            } else {
                return Step::Exit(EncodeStatus::NeedInput);
            }
        }
    }

    /// Terminal flush with nothing buffered: deliver the padded final byte.
    fn finalize(&mut self, ctx: &mut Ctx<'_>) -> Step {
        if self.writer.bits < 8 {
            if self.direct {
                self.writer.pos += 1;
                ctx.written = self.writer.pos;
                self.writer.pos = 0;
                self.direct = false;
            } else {
                if ctx.avail() == 0 {
                    return Step::Exit(EncodeStatus::NeedOutput);
                }
                ctx.out[ctx.written] = self.staging[self.writer.pos];
                ctx.written += 1;
                self.writer.pos = 0;
            }
            self.writer.bits = 8;
        } else if self.direct {
            ctx.written = self.writer.pos;
            self.writer.pos = 0;
            self.direct = false;
        } else {
            self.writer.pos = 0;
        }

        self.staging[0] = 0;
        self.flushed = true;
        trace!("stream flushed: {} bytes total", self.total_out + ctx.written);
        Step::Exit(EncodeStatus::Finished)
    }

    fn m_check_zero_block(&mut self) -> Step {
        let start = self.block_start + self.ref_block as usize;
        let end = self.block_start + self.params.block_size as usize;

        if self.data_pp[start..end].iter().any(|&d| d != 0) {
            if self.zero_blocks > 0 {
                // Flush the pending run first, then come back for this block.
                self.block_nonzero = true;
                self.mode = Mode::EncodeZero;
            } else {
                self.mode = Mode::SelectCodeOption;
            }
            return Step::Continue;
        }

        self.zero_blocks += 1;
        if self.zero_blocks == 1 {
            self.zero_ref = self.ref_block;
            self.zero_ref_sample = self.ref_sample;
        }

        let segment_end = (self.rsi_blocks - self.blocks_avail) % 64 == 0;
        if self.blocks_avail == 0 || segment_end {
            if self.zero_blocks > 4 {
                self.zero_blocks = ROS;
            }
            self.mode = Mode::EncodeZero;
        } else {
            self.mode = Mode::GetBlock;
        }
        Step::Continue
    }

    fn m_select_code_option(&mut self) -> Step {
        let split_len = if self.id_len > 1 { self.assess_splitting() } else { u64::MAX };
        let se_len = self.assess_se();
        let uncomp_len = self.uncomp_len as u64;

        self.mode = if split_len < uncomp_len {
            if se_len <= split_len { Mode::EncodeSe } else { Mode::EncodeSplitting }
        } else if se_len < uncomp_len {
            Mode::EncodeSe
        } else {
            Mode::EncodeUncomp
        };
        Step::Continue
    }

    /// CDS length of the current block under splitting with the best k.
    ///
    /// len(k) is unimodal: walk from the previous block's winner, reversing
    /// direction at most once.
    fn assess_splitting(&mut self) -> u64 {
        let start = self.block_start + self.ref_block as usize;
        let end = self.block_start + self.params.block_size as usize;
        let block = &self.data_pp[start..end];
        let this_bs = block.len() as u64;

        let mut k = self.k;
        let mut k_best = k;
        let mut dir_up = true;
        let mut no_turn = k == 0;
        let mut len_min = u64::MAX;

        loop {
            let fs_len: u64 = block.iter().map(|&d| (d >> k) as u64).sum();
            let len = fs_len + this_bs * (k as u64 + 1);

            if len < len_min {
                if len_min != u64::MAX {
                    no_turn = true;
                }
                len_min = len;
                k_best = k;

                if dir_up {
                    if fs_len < this_bs || k >= self.kmax {
                        if no_turn {
                            break;
                        }
                        k = k_best - 1;
                        dir_up = false;
                        no_turn = true;
                    } else {
                        k += 1;
                    }
                } else {
                    if fs_len >= this_bs || k == 0 {
                        break;
                    }
                    k -= 1;
                }
            } else {
                if no_turn {
                    break;
                }
                k = k_best - 1;
                dir_up = false;
                no_turn = true;
            }
        }

        self.k = k_best;
        len_min
    }

    /// CDS length of the current block under second extension, or MAX when
    /// the option is not viable (pair sums too large for the uncompressed
    /// bound; overflow falls under the same verdict).
    fn assess_se(&self) -> u64 {
        let start = self.block_start;
        let end = self.block_start + self.params.block_size as usize;
        let limit = self.uncomp_len as u64;

        let mut len: u64 = 1;
        for pair in self.data_pp[start..end].chunks_exact(2) {
            let s = pair[0] as u64 + pair[1] as u64;
            if s > limit {
                return u64::MAX;
            }
            len += s * (s + 1) / 2 + pair[1] as u64 + 1;
            if len > limit {
                return u64::MAX;
            }
        }
        len
    }

    fn m_encode_splitting(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let k = self.k;
        let id_len = self.id_len;
        let bps = self.params.bits_per_sample as u32;
        let is_ref = self.ref_block;
        let ref_sample = self.ref_sample;
        let start = self.block_start + is_ref as usize;
        let end = self.block_start + self.params.block_size as usize;
        let direct = self.direct;

        let Self { writer, staging, data_pp, .. } = self;
        let buf: &mut [u8] = if direct { &mut *ctx.out } else { staging.as_mut_slice() };
        let block = &data_pp[start..end];

        writer.emit(buf, k + 1, id_len);
        if is_ref {
            writer.emit(buf, ref_sample, bps);
        }
        writer.emitblock_fs(buf, block, k);
        if k > 0 {
            writer.emitblock(buf, block, k);
        }

        self.mode = Mode::FlushBlock;
        Step::Continue
    }

    fn m_encode_uncomp(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let id_len = self.id_len;
        let bps = self.params.bits_per_sample as u32;
        let start = self.block_start;
        let end = self.block_start + self.params.block_size as usize;
        let direct = self.direct;

        if self.ref_block {
            // The whole block goes out literally, reference sample included.
            self.data_pp[start] = self.ref_sample;
        }

        let Self { writer, staging, data_pp, .. } = self;
        let buf: &mut [u8] = if direct { &mut *ctx.out } else { staging.as_mut_slice() };

        writer.emit(buf, (1u32 << id_len) - 1, id_len);
        writer.emitblock(buf, &data_pp[start..end], bps);

        self.mode = Mode::FlushBlock;
        Step::Continue
    }

    fn m_encode_se(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let id_len = self.id_len;
        let bps = self.params.bits_per_sample as u32;
        let is_ref = self.ref_block;
        let ref_sample = self.ref_sample;
        let start = self.block_start;
        let end = self.block_start + self.params.block_size as usize;
        let direct = self.direct;

        let Self { writer, staging, data_pp, .. } = self;
        let buf: &mut [u8] = if direct { &mut *ctx.out } else { staging.as_mut_slice() };

        writer.emit(buf, 1, id_len + 1);
        if is_ref {
            writer.emit(buf, ref_sample, bps);
        }
        for pair in data_pp[start..end].chunks_exact(2) {
            let s = pair[0] as u64 + pair[1] as u64;
            let fs = s * (s + 1) / 2 + pair[1] as u64;
            writer.emitfs(buf, fs as u32);
        }

        self.mode = Mode::FlushBlock;
        Step::Continue
    }

    fn m_encode_zero(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let id_len = self.id_len;
        let bps = self.params.bits_per_sample as u32;
        let zero_ref = self.zero_ref;
        let zero_ref_sample = self.zero_ref_sample;
        let zero_blocks = self.zero_blocks;
        let direct = self.direct;

        let Self { writer, staging, .. } = self;
        let buf: &mut [u8] = if direct { &mut *ctx.out } else { staging.as_mut_slice() };

        writer.emit(buf, 0, id_len + 1);
        if zero_ref {
            writer.emit(buf, zero_ref_sample, bps);
        }
        if zero_blocks == ROS {
            writer.emitfs(buf, 4);
        } else if zero_blocks >= 5 {
            writer.emitfs(buf, zero_blocks);
        } else {
            writer.emitfs(buf, zero_blocks - 1);
        }

        self.zero_blocks = 0;
        self.zero_ref = false;
        self.mode = Mode::FlushBlock;
        Step::Continue
    }

    fn m_flush_block(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let pad_rsi = self.params.flags.contains(AecFlags::PAD_RSI);
        if pad_rsi && self.blocks_avail == 0 && !self.block_nonzero {
            let pad = self.writer.bits % 8;
            let direct = self.direct;
            let Self { writer, staging, .. } = self;
            let buf: &mut [u8] = if direct { &mut *ctx.out } else { staging.as_mut_slice() };
            writer.emit(buf, 0, pad);
        }

        if self.direct {
            ctx.written = self.writer.pos;
            self.mode = Mode::GetBlock;
        } else {
            self.i = 0;
            self.mode = Mode::FlushBlockResumable;
        }
        Step::Continue
    }

    fn m_flush_block_resumable(&mut self, ctx: &mut Ctx<'_>) -> Step {
        let n = (self.writer.pos - self.i).min(ctx.avail());
        ctx.out[ctx.written..ctx.written + n].copy_from_slice(&self.staging[self.i..self.i + n]);
        ctx.written += n;
        self.i += n;

        if ctx.avail() == 0 {
            return Step::Exit(EncodeStatus::NeedOutput);
        }
        self.mode = Mode::GetBlock;
        Step::Continue
    }
}

/// One-shot convenience: encode a complete buffer of packed samples.
pub fn encode(input: &[u8], params: AecParams) -> Result<Vec<u8>, AecError> {
    let mut enc = Encoder::new(params)?;
    enc.push_input(input);

    let mut out = Vec::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        let (n, status) = enc.encode(&mut chunk, Flush::Flush);
        out.extend_from_slice(&chunk[..n]);
        match status {
            EncodeStatus::Finished => break,
            EncodeStatus::NeedOutput => {}
            EncodeStatus::NeedInput => unreachable!("flush never requests input"),
        }
    }
    enc.finish()?;
    Ok(out)
}
