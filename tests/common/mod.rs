//! Minimal AEC reader used to verify round-trips.
//!
//! Written against the CDS wire format directly (option IDs, fundamental
//! sequences, reference samples, zero runs) and kept independent of the
//! encoder internals: it reconstructs samples from first principles so an
//! encoder bug cannot cancel out in both directions.

use rust_aec_encoder::{AecFlags, AecParams};

pub struct BitCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn bits(&mut self, nbits: u32) -> u32 {
        let mut v = 0u32;
        for _ in 0..nbits {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            v = (v << 1) | bit as u32;
            self.pos += 1;
        }
        v
    }

    pub fn unary(&mut self) -> u32 {
        let mut n = 0;
        while self.bits(1) == 0 {
            n += 1;
            assert!(n < 1 << 20, "unary run too long at bit {}", self.pos);
        }
        n
    }

    pub fn align(&mut self) {
        self.pos = self.pos.div_ceil(8) * 8;
    }
}

fn id_len_of(params: &AecParams) -> u32 {
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

/// Invert the folding map: previous sample + residual -> next sample.
fn unmap(prev: i64, d: u32, xmin: i64, xmax: i64) -> i64 {
    let theta = (prev - xmin).min(xmax - prev);
    let d = d as i64;
    if d <= 2 * theta {
        if d % 2 == 0 { prev + d / 2 } else { prev - (d + 1) / 2 }
    } else if prev - xmin <= xmax - prev {
        xmin + d
    } else {
        xmax - d
    }
}

/// Invert a second-extension symbol into its residual pair.
fn unpair(m: u32) -> (u32, u32) {
    let mut s = 0u32;
    while (s + 1) * (s + 2) / 2 <= m {
        s += 1;
    }
    let b = m - s * (s + 1) / 2;
    (s - b, b)
}

/// Decode `n_samples` from an AEC bitstream. Returns the raw sample fields
/// (bit patterns masked to `bits_per_sample`).
pub fn decode(cds: &[u8], params: AecParams, n_samples: usize) -> Vec<u32> {
    let bps = params.bits_per_sample as u32;
    let bs = params.block_size as usize;
    let rsi = params.rsi;
    let id_len = id_len_of(&params);
    let max_id = (1u32 << id_len) - 1;
    let preprocess = params.flags.contains(AecFlags::DATA_PREPROCESS);
    let signed = params.flags.contains(AecFlags::DATA_SIGNED);
    let pad_rsi = params.flags.contains(AecFlags::PAD_RSI);

    let mask: u32 = (((1u64 << bps) - 1) & 0xffff_ffff) as u32;
    let (xmin, xmax): (i64, i64) = if signed {
        (-(1i64 << (bps - 1)), (1i64 << (bps - 1)) - 1)
    } else {
        (0, (1i64 << bps) - 1)
    };

    let mut cur = BitCursor::new(cds);
    let mut out: Vec<u32> = Vec::with_capacity(n_samples);
    let mut prev: i64 = 0;
    let mut block_idx: u32 = 0;

    let interp = |raw: u32| -> i64 {
        if signed {
            let m = 1i64 << (bps - 1);
            (((raw as i64) & (2 * m - 1)) ^ m) - m
        } else {
            raw as i64
        }
    };

    while out.len() < n_samples {
        let at_ref = preprocess && block_idx == 0;
        let id = cur.bits(id_len);
        let mut got_ref = false;

        let emit = |out: &mut Vec<u32>, prev: &mut i64, v: u32| {
            if out.len() >= n_samples {
                return;
            }
            if preprocess {
                let x = unmap(*prev, v, xmin, xmax);
                *prev = x;
                out.push((x as u64 as u32) & mask);
            } else {
                out.push(v & mask);
            }
        };

        if id == 0 {
            let se = cur.bits(1) == 1;
            if at_ref {
                let raw = cur.bits(bps);
                out.push(raw & mask);
                prev = interp(raw);
                got_ref = true;
            }

            if se {
                let mut vals = Vec::with_capacity(bs);
                for _ in 0..bs / 2 {
                    let (a, b) = unpair(cur.unary());
                    vals.push(a);
                    vals.push(b);
                }
                for &v in &vals[got_ref as usize..] {
                    emit(&mut out, &mut prev, v);
                }
            } else {
                let f = cur.unary();
                let mut zb = f + 1;
                if zb == 5 {
                    zb = (rsi - block_idx).min(64 - block_idx % 64);
                } else if zb > 5 {
                    zb -= 1;
                }

                let zeros = zb as usize * bs - got_ref as usize;
                for _ in 0..zeros {
                    emit(&mut out, &mut prev, 0);
                }

                block_idx += zb;
                if block_idx >= rsi {
                    block_idx = 0;
                    if pad_rsi {
                        cur.align();
                    }
                }
                continue;
            }
        } else if id == max_id {
            if at_ref {
                let raw = cur.bits(bps);
                out.push(raw & mask);
                prev = interp(raw);
                got_ref = true;
            }
            for _ in 0..bs - got_ref as usize {
                let v = cur.bits(bps);
                emit(&mut out, &mut prev, v);
            }
        } else {
            let k = id - 1;
            if at_ref {
                let raw = cur.bits(bps);
                out.push(raw & mask);
                prev = interp(raw);
                got_ref = true;
            }
            let n = bs - got_ref as usize;
            let mut vals: Vec<u32> = (0..n).map(|_| cur.unary() << k).collect();
            if k > 0 {
                for v in vals.iter_mut() {
                    *v |= cur.bits(k);
                }
            }
            for &v in &vals {
                emit(&mut out, &mut prev, v);
            }
        }

        block_idx += 1;
        if block_idx >= rsi {
            block_idx = 0;
            if pad_rsi {
                cur.align();
            }
        }
    }

    out
}

/// Pack sample fields into the byte layout the encoder consumes.
pub fn pack(samples: &[u32], params: AecParams) -> Vec<u8> {
    let msb = params.flags.contains(AecFlags::MSB);
    let bytes = match params.bits_per_sample {
        1..=8 => 1,
        9..=16 => 2,
        17..=24 if params.flags.contains(AecFlags::DATA_3BYTE) => 3,
        _ => 4,
    };

    let mut out = Vec::with_capacity(samples.len() * bytes);
    for &s in samples {
        if msb {
            for i in (0..bytes).rev() {
                out.push((s >> (8 * i)) as u8);
            }
        } else {
            for i in 0..bytes {
                out.push((s >> (8 * i)) as u8);
            }
        }
    }
    out
}
