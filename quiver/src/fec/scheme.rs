// Copyright (C) 2018-2019, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Erasure-coding schemes.
//!
//! The pipeline only knows the capability set: can a block be recovered,
//! recover it, and generate repair symbols over a set of source packets.
//! Three schemes implement it: single-parity XOR, random linear codes over
//! GF(256), and Reed-Solomon.

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::fec::block::FecBlock;
use crate::fec::RepairSymbol;

use crate::Error;
use crate::FecSchemeKind;
use crate::Result;

/// The capability set the FEC pipelines require of a scheme.
///
/// `id` is the 24-bit block number for block codes, or the encoding symbol
/// id for convolutional windows; schemes may fold it into their coefficient
/// derivation.
pub trait FecScheme {
    /// Whether the buffered packets and repair symbols of `block` suffice
    /// to recover its missing source packets.
    fn can_recover(&self, block: &FecBlock) -> bool;

    /// Recovers the missing source packets of `block`.
    fn recover(&self, block: &FecBlock) -> Result<Vec<Vec<u8>>>;

    /// Produces `count` repair symbols over the given source packets.
    fn generate_repair_symbols(
        &self, packets: &[&[u8]], count: usize, id: u64,
    ) -> Result<Vec<RepairSymbol>>;
}

/// Builds the scheme selected by the configuration.
pub fn new_fec_scheme(kind: FecSchemeKind) -> Box<dyn FecScheme> {
    match kind {
        FecSchemeKind::Xor => Box::new(XorScheme),
        FecSchemeKind::Rlc => Box::new(RlcScheme),
        FecSchemeKind::ReedSolomon => Box::new(RsScheme),
    }
}

/// Single parity symbol per block; repairs exactly one erasure.
pub struct XorScheme;

impl FecScheme for XorScheme {
    fn can_recover(&self, block: &FecBlock) -> bool {
        block.total_source() > 0 &&
            block.missing_source_packets() == 1 &&
            block.current_number_of_repair_symbols() >= 1
    }

    fn recover(&self, block: &FecBlock) -> Result<Vec<Vec<u8>>> {
        let symbol = block
            .repair_symbols()
            .first()
            .ok_or(Error::FecFailed)?;

        let mut shard = symbol.data.clone();

        for packet in block.packets().iter().flatten() {
            let encoded = encode_shard(packet, shard.len())?;

            for (d, s) in shard.iter_mut().zip(encoded.iter()) {
                *d ^= s;
            }
        }

        Ok(vec![decode_shard(&shard)?])
    }

    fn generate_repair_symbols(
        &self, packets: &[&[u8]], _count: usize, id: u64,
    ) -> Result<Vec<RepairSymbol>> {
        if packets.is_empty() {
            return Err(Error::FecFailed);
        }

        let shard_len = shard_len(packets);

        let mut parity = vec![0u8; shard_len];

        for packet in packets {
            let encoded = encode_shard(packet, shard_len)?;

            for (d, s) in parity.iter_mut().zip(encoded.iter()) {
                *d ^= s;
            }
        }

        Ok(vec![RepairSymbol {
            scheme_specific: 0,
            block_number: id,
            symbol_index: 0,
            data: parity,
            num_source: packets.len() as u8,
            num_repair: 1,
            convolutional: false,
            encoding_symbol_id: 0,
        }])
    }
}

/// Random linear code over GF(256).
///
/// Every repair symbol is a random linear combination of the source
/// shards; coefficients are derived deterministically from (id, symbol
/// index), so the receiver regenerates them without carrying them on the
/// wire. Any r linearly independent symbols recover up to r erasures.
pub struct RlcScheme;

impl RlcScheme {
    fn coefficients(id: u64, symbol_index: u8, k: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(id << 8 | u64::from(symbol_index));

        (0..k)
            .map(|_| loop {
                let c: u8 = rng.gen();
                if c != 0 {
                    return c;
                }
            })
            .collect()
    }
}

impl FecScheme for RlcScheme {
    fn can_recover(&self, block: &FecBlock) -> bool {
        let missing = block.missing_source_packets();

        block.total_source() > 0 &&
            missing >= 1 &&
            block.current_number_of_repair_symbols() >= missing
    }

    fn recover(&self, block: &FecBlock) -> Result<Vec<Vec<u8>>> {
        let k = block.total_source();

        let missing: Vec<usize> = (0..k)
            .filter(|&i| {
                block.packets().get(i).map_or(true, |p| p.is_none())
            })
            .collect();

        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let symbols = block.repair_symbols();
        let shard_len = symbols
            .first()
            .map(|s| s.data.len())
            .ok_or(Error::FecFailed)?;

        // One equation per repair symbol: subtract the contribution of the
        // present shards, leaving a system over the missing ones.
        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

        for symbol in symbols {
            if symbol.data.len() != shard_len {
                return Err(Error::FecFailed);
            }

            let coeffs =
                Self::coefficients(block.block_number(), symbol.symbol_index, k);

            let mut rhs = symbol.data.clone();

            for (i, packet) in block.packets().iter().enumerate() {
                let packet = match packet {
                    Some(p) => p,
                    None => continue,
                };

                let encoded = encode_shard(packet, shard_len)?;

                for (d, s) in rhs.iter_mut().zip(encoded.iter()) {
                    *d ^= gf256::mul(coeffs[i], *s);
                }
            }

            let row: Vec<u8> = missing.iter().map(|&i| coeffs[i]).collect();

            rows.push((row, rhs));
        }

        let solved = gf256::solve(rows, missing.len(), shard_len)?;

        solved.iter().map(|shard| decode_shard(shard)).collect()
    }

    fn generate_repair_symbols(
        &self, packets: &[&[u8]], count: usize, id: u64,
    ) -> Result<Vec<RepairSymbol>> {
        if packets.is_empty() || count == 0 {
            return Err(Error::FecFailed);
        }

        let shard_len = shard_len(packets);

        let mut symbols = Vec::with_capacity(count);

        for index in 0..count {
            let coeffs = Self::coefficients(id, index as u8, packets.len());

            let mut data = vec![0u8; shard_len];

            for (i, packet) in packets.iter().enumerate() {
                let encoded = encode_shard(packet, shard_len)?;

                for (d, s) in data.iter_mut().zip(encoded.iter()) {
                    *d ^= gf256::mul(coeffs[i], *s);
                }
            }

            symbols.push(RepairSymbol {
                scheme_specific: 0,
                block_number: id,
                symbol_index: index as u8,
                data,
                num_source: packets.len() as u8,
                num_repair: count as u8,
                convolutional: false,
                encoding_symbol_id: 0,
            });
        }

        Ok(symbols)
    }
}

/// Reed-Solomon over GF(256), via `reed-solomon-erasure`.
pub struct RsScheme;

impl FecScheme for RsScheme {
    fn can_recover(&self, block: &FecBlock) -> bool {
        let missing = block.missing_source_packets();

        block.total_source() > 0 &&
            missing >= 1 &&
            block.current_number_of_repair_symbols() >= missing &&
            block.total_source() + block.total_repair() <= 255
    }

    fn recover(&self, block: &FecBlock) -> Result<Vec<Vec<u8>>> {
        let k = block.total_source();
        let r = block.total_repair().max(1);

        let rs = ReedSolomon::new(k, r).map_err(|_| Error::FecFailed)?;

        let symbols = block.repair_symbols();
        let shard_len = symbols
            .first()
            .map(|s| s.data.len())
            .ok_or(Error::FecFailed)?;

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; k + r];

        for (i, packet) in block.packets().iter().enumerate() {
            if i >= k {
                break;
            }

            if let Some(packet) = packet {
                shards[i] = Some(encode_shard(packet, shard_len)?);
            }
        }

        for symbol in symbols {
            let idx = k + symbol.symbol_index as usize;

            if idx >= shards.len() || symbol.data.len() != shard_len {
                return Err(Error::FecFailed);
            }

            shards[idx] = Some(symbol.data.clone());
        }

        let was_missing: Vec<usize> = (0..k)
            .filter(|&i| shards[i].is_none())
            .collect();

        rs.reconstruct(&mut shards).map_err(|_| Error::FecFailed)?;

        was_missing
            .iter()
            .map(|&i| {
                let shard = shards[i].as_ref().ok_or(Error::FecFailed)?;
                decode_shard(shard)
            })
            .collect()
    }

    fn generate_repair_symbols(
        &self, packets: &[&[u8]], count: usize, id: u64,
    ) -> Result<Vec<RepairSymbol>> {
        if packets.is_empty() || count == 0 || packets.len() + count > 255 {
            return Err(Error::FecFailed);
        }

        let rs = ReedSolomon::new(packets.len(), count)
            .map_err(|_| Error::FecFailed)?;

        let shard_len = shard_len(packets);

        let mut shards: Vec<Vec<u8>> = packets
            .iter()
            .map(|p| encode_shard(p, shard_len))
            .collect::<Result<_>>()?;

        shards.extend(std::iter::repeat(vec![0u8; shard_len]).take(count));

        rs.encode(&mut shards).map_err(|_| Error::FecFailed)?;

        let symbols = shards
            .split_off(packets.len())
            .into_iter()
            .enumerate()
            .map(|(index, data)| RepairSymbol {
                scheme_specific: 0,
                block_number: id,
                symbol_index: index as u8,
                data,
                num_source: packets.len() as u8,
                num_repair: count as u8,
                convolutional: false,
                encoding_symbol_id: 0,
            })
            .collect();

        Ok(symbols)
    }
}

// A shard is a source packet prefixed with its 16-bit length and
// zero-padded to the block's common shard length, so variable-size packets
// code over a rectangular matrix.
fn shard_len(packets: &[&[u8]]) -> usize {
    2 + packets.iter().map(|p| p.len()).max().unwrap_or(0)
}

fn encode_shard(packet: &[u8], shard_len: usize) -> Result<Vec<u8>> {
    if packet.len() + 2 > shard_len || packet.len() > u16::MAX as usize {
        return Err(Error::FecFailed);
    }

    let mut shard = vec![0u8; shard_len];

    shard[..2].copy_from_slice(&(packet.len() as u16).to_be_bytes());
    shard[2..2 + packet.len()].copy_from_slice(packet);

    Ok(shard)
}

fn decode_shard(shard: &[u8]) -> Result<Vec<u8>> {
    if shard.len() < 2 {
        return Err(Error::FecFailed);
    }

    let len = u16::from_be_bytes([shard[0], shard[1]]) as usize;

    if 2 + len > shard.len() {
        return Err(Error::FecFailed);
    }

    Ok(shard[2..2 + len].to_vec())
}

// GF(2^8) arithmetic with primitive polynomial 0x11d, plus the Gaussian
// elimination used by the random linear code.
mod gf256 {
    use crate::Error;
    use crate::Result;

    const fn gen_tables() -> ([u8; 256], [u8; 512]) {
        let mut log = [0u8; 256];
        let mut exp = [0u8; 512];

        let mut x: u16 = 1;
        let mut i = 0;

        while i < 255 {
            exp[i] = x as u8;
            exp[i + 255] = x as u8;
            log[x as usize] = i as u8;

            x <<= 1;

            if x & 0x100 != 0 {
                x ^= 0x11d;
            }

            i += 1;
        }

        (log, exp)
    }

    const TABLES: ([u8; 256], [u8; 512]) = gen_tables();
    const LOG: [u8; 256] = TABLES.0;
    const EXP: [u8; 512] = TABLES.1;

    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }

        EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
    }

    pub fn inv(a: u8) -> u8 {
        EXP[255 - LOG[a as usize] as usize]
    }

    /// Solves the linear system given as `(coefficients, rhs)` rows for
    /// `unknowns` shard-valued unknowns of length `shard_len`, by Gaussian
    /// elimination. Fails when the rows do not span the unknowns.
    pub fn solve(
        mut rows: Vec<(Vec<u8>, Vec<u8>)>, unknowns: usize, shard_len: usize,
    ) -> Result<Vec<Vec<u8>>> {
        if rows.len() < unknowns {
            return Err(Error::FecFailed);
        }

        for col in 0..unknowns {
            // Find a pivot row for this column.
            let pivot = (col..rows.len())
                .find(|&r| rows[r].0[col] != 0)
                .ok_or(Error::FecFailed)?;

            rows.swap(col, pivot);

            // Normalize the pivot row.
            let inv_p = inv(rows[col].0[col]);

            for c in rows[col].0.iter_mut() {
                *c = mul(*c, inv_p);
            }

            for b in rows[col].1.iter_mut() {
                *b = mul(*b, inv_p);
            }

            // Eliminate the column from every other row.
            for r in 0..rows.len() {
                if r == col || rows[r].0[col] == 0 {
                    continue;
                }

                let factor = rows[r].0[col];

                let (pivot_coeffs, pivot_rhs) = {
                    let row = &rows[col];
                    (row.0.clone(), row.1.clone())
                };

                for (c, p) in rows[r].0.iter_mut().zip(pivot_coeffs.iter()) {
                    *c ^= mul(factor, *p);
                }

                for (b, p) in rows[r].1.iter_mut().zip(pivot_rhs.iter()) {
                    *b ^= mul(factor, *p);
                }
            }
        }

        Ok(rows
            .into_iter()
            .take(unknowns)
            .map(|(_, mut rhs)| {
                rhs.truncate(shard_len);
                rhs
            })
            .collect())
    }

}
