//! Deterministic type-directed mutation of corpus values.
//!
//! Both sides of the RPC run the same mutator: the worker drives it forward
//! while fuzzing, the coordinator replays it from a saved PRNG snapshot to
//! reconstruct the exact input of a crashing iteration. Everything here must
//! therefore depend only on the value vector, the byte budget and the PRNG
//! stream.
use crate::rng::PcgRng;
use crate::value::Value;
use rand::prelude::*;

const INTERESTING_INTS: [u64; 8] = [0, 1, 7, 0x7f, 0xff, 0x7fff, 0xffff_ffff, u64::MAX];
const INTERESTING_FLOATS: [f64; 6] = [0.0, -1.0, 1.0, 0.5, 1e9, -1e9];

pub struct Mutator {
    rng: PcgRng,
}

impl Mutator {
    pub fn new() -> Mutator {
        Mutator::with_rng(PcgRng::new())
    }

    pub fn with_rng(rng: PcgRng) -> Mutator {
        Mutator { rng }
    }

    pub fn rng(&self) -> &PcgRng {
        &self.rng
    }

    pub fn rng_mut(&mut self) -> &mut PcgRng {
        &mut self.rng
    }

    /// Mutates one value of `vals` in place. The marshaled size of the vector
    /// never grows past `max_bytes`.
    pub fn mutate(&mut self, vals: &mut [Value], max_bytes: usize) {
        if vals.is_empty() {
            return;
        }
        let used: usize = vals.iter().map(Value::byte_len).sum();
        let can_grow = used < max_bytes;

        let idx = self.rng.gen_range(0..vals.len());
        let mut tries = 0;
        let mut mutated = false;
        while tries < 8 && (!mutated || self.rng.gen_ratio(1, 4)) {
            mutated |= self.mutate_one(&mut vals[idx], can_grow);
            tries += 1;
        }
    }

    fn mutate_one(&mut self, val: &mut Value, can_grow: bool) -> bool {
        match val {
            Value::Bool(b) => {
                *b = !*b;
                true
            }
            Value::F32(v) => {
                let mut f = *v as f64;
                let ok = self.mutate_float(&mut f);
                *v = f as f32;
                ok
            }
            Value::F64(v) => self.mutate_float(v),
            Value::Int(v) => {
                let mut raw = *v as u64;
                let ok = self.mutate_int(&mut raw, 64);
                *v = raw as isize;
                ok
            }
            Value::I8(v) => {
                let mut raw = *v as u64;
                let ok = self.mutate_int(&mut raw, 8);
                *v = raw as i8;
                ok
            }
            Value::I16(v) => {
                let mut raw = *v as u64;
                let ok = self.mutate_int(&mut raw, 16);
                *v = raw as i16;
                ok
            }
            Value::I32(v) => {
                let mut raw = *v as u64;
                let ok = self.mutate_int(&mut raw, 32);
                *v = raw as i32;
                ok
            }
            Value::I64(v) => {
                let mut raw = *v as u64;
                let ok = self.mutate_int(&mut raw, 64);
                *v = raw as i64;
                ok
            }
            Value::Uint(v) => {
                let mut raw = *v as u64;
                let ok = self.mutate_int(&mut raw, 64);
                *v = raw as usize;
                ok
            }
            Value::U8(v) => {
                let mut raw = *v as u64;
                let ok = self.mutate_int(&mut raw, 8);
                *v = raw as u8;
                ok
            }
            Value::U16(v) => {
                let mut raw = *v as u64;
                let ok = self.mutate_int(&mut raw, 16);
                *v = raw as u16;
                ok
            }
            Value::U32(v) => {
                let mut raw = *v as u64;
                let ok = self.mutate_int(&mut raw, 32);
                *v = raw as u32;
                ok
            }
            Value::U64(v) => self.mutate_int(v, 64),
            Value::Bytes(buf) => self.mutate_bytes(buf, can_grow),
            Value::Str(s) => self.mutate_str(s, can_grow),
        }
    }

    fn mutate_int(&mut self, val: &mut u64, bit_sz: u32) -> bool {
        let old = *val;
        let mut new = if self.rng.gen_ratio(1, 3) {
            old.wrapping_add(self.rng.gen_range(1..=4))
        } else if self.rng.gen_ratio(1, 2) {
            old.wrapping_sub(self.rng.gen_range(1..=4))
        } else if self.rng.gen_ratio(1, 2) {
            old ^ (1u64 << self.rng.gen_range(0..bit_sz))
        } else {
            *INTERESTING_INTS.choose(&mut self.rng).unwrap()
        };
        if bit_sz < 64 {
            new &= (1u64 << bit_sz) - 1;
        }
        let mutated = new != old;
        *val = new;
        mutated
    }

    fn mutate_float(&mut self, val: &mut f64) -> bool {
        let old = *val;
        let new = match self.rng.gen_range(0..4u8) {
            0 => -old,
            1 => old * 2.0,
            2 => old / 2.0 + 1.0,
            _ => *INTERESTING_FLOATS.choose(&mut self.rng).unwrap(),
        };
        // NaN would survive neither comparison nor replay checks; keep the
        // stream deterministic and skip it.
        let new = if new.is_finite() { new } else { old + 1.0 };
        let mutated = new.to_bits() != old.to_bits();
        *val = new;
        mutated
    }

    fn mutate_bytes(&mut self, buf: &mut Vec<u8>, can_grow: bool) -> bool {
        if buf.is_empty() {
            if !can_grow {
                return false;
            }
            buf.push(self.rng.gen());
            return true;
        }
        match self.rng.gen_range(0..5u8) {
            0 => {
                // flip one bit
                let i = self.rng.gen_range(0..buf.len());
                buf[i] ^= 1 << self.rng.gen_range(0..8u8);
                true
            }
            1 => {
                let i = self.rng.gen_range(0..buf.len());
                buf[i] = self.rng.gen();
                true
            }
            2 if can_grow => {
                let i = self.rng.gen_range(0..=buf.len());
                buf.insert(i, self.rng.gen());
                true
            }
            3 if buf.len() > 1 => {
                let i = self.rng.gen_range(0..buf.len());
                buf.remove(i);
                true
            }
            4 if buf.len() >= 2 => {
                let len = self.rng.gen_range(2..=buf.len().min(8));
                let start = self.rng.gen_range(0..=buf.len() - len);
                buf[start..start + len].shuffle(&mut self.rng);
                true
            }
            _ => {
                let i = self.rng.gen_range(0..buf.len());
                buf[i] = buf[i].wrapping_add(1);
                true
            }
        }
    }

    fn mutate_str(&mut self, s: &mut String, can_grow: bool) -> bool {
        let printable = |r: &mut PcgRng| -> char { r.gen_range(b' '..=b'~') as char };
        if s.is_empty() {
            if !can_grow {
                return false;
            }
            s.push(printable(&mut self.rng));
            return true;
        }
        let chars: Vec<char> = s.chars().collect();
        match self.rng.gen_range(0..3u8) {
            0 if can_grow => {
                let i = self.rng.gen_range(0..=chars.len());
                let c = printable(&mut self.rng);
                let mut out: String = chars[..i].iter().collect();
                out.push(c);
                out.extend(&chars[i..]);
                *s = out;
                true
            }
            1 if chars.len() > 1 => {
                let i = self.rng.gen_range(0..chars.len());
                let mut out: String = chars[..i].iter().collect();
                out.extend(&chars[i + 1..]);
                *s = out;
                true
            }
            _ => {
                let i = self.rng.gen_range(0..chars.len());
                let c = printable(&mut self.rng);
                let mut out: String = chars[..i].iter().collect();
                out.push(c);
                out.extend(&chars[i + 1..]);
                *s = out;
                true
            }
        }
    }
}

impl Default for Mutator {
    fn default() -> Self {
        Mutator::new()
    }
}
