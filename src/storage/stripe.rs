//! Logical-to-physical mapping of chunk ranges.

use smallvec::SmallVec;

use super::chunk::{Chunk, Device, Profile};
use crate::primitives::io::DispatchContext;
use crate::types::{ArborError, Result};

/// A piece of a logical range placed on one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysExtent {
    /// Target device.
    pub dev_id: u64,
    /// Physical byte offset on the device.
    pub physical: u64,
    /// Offset of the piece inside the caller's buffer.
    pub buf_offset: usize,
    /// Piece length.
    pub len: usize,
}

/// Physical pieces of one logical range.
pub type PhysMap = SmallVec<[PhysExtent; 4]>;

fn check_range(chunk: &Chunk, logical: u64, len: usize) -> Result<u64> {
    if !chunk.contains(logical, len as u64) {
        return Err(ArborError::Inconsistent(format!(
            "range {logical:#x}+{len} outside chunk {:#x}",
            chunk.offset
        )));
    }
    Ok(logical - chunk.offset)
}

fn parity_count(profile: Profile) -> usize {
    match profile {
        Profile::Raid5 => 1,
        Profile::Raid6 => 2,
        _ => 0,
    }
}

/// Device index holding data stripe `i` of parity row `row`.
fn parity_data_index(num_stripes: usize, row: u64, i: usize) -> usize {
    ((row as usize) + i) % num_stripes
}

/// Device index holding the first parity stripe of `row`.
fn parity_index(num_stripes: usize, parity: usize, row: u64) -> usize {
    ((row as usize) + num_stripes - parity) % num_stripes
}

/// Parity row holding `address`; writes with equal rows must not run
/// concurrently.
pub fn parity_row(chunk: &Chunk, address: u64) -> u64 {
    let data = (chunk.stripes.len() - parity_count(chunk.profile()).max(1)).max(1) as u64;
    (address - chunk.offset) / (chunk.stripe_len * data)
}

/// Maps a write to every copy it must reach. Parity profiles are written
/// through [`write_parity`] instead.
pub fn map_write(chunk: &Chunk, logical: u64, len: usize) -> Result<PhysMap> {
    map(chunk, logical, len, true)
}

/// Maps a read to one copy of every byte.
pub fn map_read(chunk: &Chunk, logical: u64, len: usize) -> Result<PhysMap> {
    map(chunk, logical, len, false)
}

fn map(chunk: &Chunk, logical: u64, len: usize, all_copies: bool) -> Result<PhysMap> {
    let off = check_range(chunk, logical, len)?;
    let mut out = PhysMap::new();
    let profile = chunk.profile();
    match profile {
        Profile::Single | Profile::Dup | Profile::Raid1 => {
            let copies = if all_copies { chunk.stripes.len() } else { 1 };
            for stripe in chunk.stripes.iter().take(copies) {
                out.push(PhysExtent {
                    dev_id: stripe.dev_id,
                    physical: stripe.offset + off,
                    buf_offset: 0,
                    len,
                });
            }
            return Ok(out);
        }
        Profile::Raid5 | Profile::Raid6 if all_copies => {
            return Err(ArborError::Inconsistent(
                "parity chunk writes need read-modify-write".to_string(),
            ));
        }
        _ => {}
    }
    let n = chunk.stripes.len();
    let stripe_len = chunk.stripe_len;
    let mut done = 0usize;
    while done < len {
        let pos = off + done as u64;
        let stripe_nr = pos / stripe_len;
        let in_stripe = pos % stripe_len;
        let piece = ((stripe_len - in_stripe) as usize).min(len - done);
        let mut push = |idx: usize, row: u64| {
            let stripe = &chunk.stripes[idx];
            out.push(PhysExtent {
                dev_id: stripe.dev_id,
                physical: stripe.offset + row * stripe_len + in_stripe,
                buf_offset: done,
                len: piece,
            });
        };
        match profile {
            Profile::Raid0 => push((stripe_nr % n as u64) as usize, stripe_nr / n as u64),
            Profile::Raid10 => {
                let sub = chunk.sub_stripes.max(1) as usize;
                let groups = (n / sub) as u64;
                let group = (stripe_nr % groups) as usize;
                let row = stripe_nr / groups;
                let copies = if all_copies { sub } else { 1 };
                for copy in 0..copies {
                    push(group * sub + copy, row);
                }
            }
            _ => {
                let data = n - parity_count(profile);
                let row = stripe_nr / data as u64;
                let i = (stripe_nr % data as u64) as usize;
                push(parity_data_index(n, row, i), row);
            }
        }
        done += piece;
    }
    Ok(out)
}

fn device<'a>(devices: &'a [Device], dev_id: u64) -> Result<&'a Device> {
    devices
        .iter()
        .find(|d| d.id() == dev_id)
        .ok_or_else(|| ArborError::Inconsistent(format!("stripe on unknown device {dev_id}")))
}

/// Reads a logical range of `chunk` into `dst`.
pub fn read_logical(chunk: &Chunk, devices: &[Device], logical: u64, dst: &mut [u8]) -> Result<()> {
    for piece in map_read(chunk, logical, dst.len())? {
        let dev = device(devices, piece.dev_id)?;
        dev.io.read_at(
            piece.physical,
            &mut dst[piece.buf_offset..piece.buf_offset + piece.len],
        )?;
    }
    Ok(())
}

/// Queues a logical write of a non-parity chunk on `ctx`.
pub fn submit_write(
    chunk: &Chunk,
    devices: &[Device],
    ctx: &mut DispatchContext,
    logical: u64,
    data: &[u8],
) -> Result<()> {
    for piece in map_write(chunk, logical, data.len())? {
        let dev = device(devices, piece.dev_id)?;
        ctx.submit(
            piece.dev_id,
            dev.io.clone(),
            piece.physical,
            data[piece.buf_offset..piece.buf_offset + piece.len].to_vec(),
        );
    }
    Ok(())
}

/// Writes into a single-parity chunk by rewriting every touched row's data
/// and parity stripes. Runs synchronously.
pub fn write_parity(chunk: &Chunk, devices: &[Device], logical: u64, data: &[u8]) -> Result<()> {
    let profile = chunk.profile();
    if profile == Profile::Raid6 {
        return Err(ArborError::Unsupported("writes to raid6 chunks"));
    }
    if profile != Profile::Raid5 {
        return Err(ArborError::Invalid("write_parity on a non-parity chunk"));
    }
    let off = check_range(chunk, logical, data.len())?;
    let n = chunk.stripes.len();
    let data_stripes = n - 1;
    let stripe_len = chunk.stripe_len as usize;
    let row_len = (stripe_len * data_stripes) as u64;
    let first_row = off / row_len;
    let last_row = (off + data.len() as u64 - 1) / row_len;
    for row in first_row..=last_row {
        let row_start = row * row_len;
        let mut stripes = vec![vec![0u8; stripe_len]; data_stripes];
        for (i, buf) in stripes.iter_mut().enumerate() {
            let stripe = &chunk.stripes[parity_data_index(n, row, i)];
            let phys = stripe.offset + row * stripe_len as u64;
            device(devices, stripe.dev_id)?.io.read_at(phys, buf)?;
        }
        let lo = off.max(row_start);
        let hi = (off + data.len() as u64).min(row_start + row_len);
        let mut touched = vec![false; data_stripes];
        for pos in lo..hi {
            let in_row = (pos - row_start) as usize;
            let (i, at) = (in_row / stripe_len, in_row % stripe_len);
            stripes[i][at] = data[(pos - off) as usize];
            touched[i] = true;
        }
        let mut parity = vec![0u8; stripe_len];
        for buf in &stripes {
            for (p, b) in parity.iter_mut().zip(buf) {
                *p ^= b;
            }
        }
        for (i, buf) in stripes.iter().enumerate() {
            if !touched[i] {
                continue;
            }
            let stripe = &chunk.stripes[parity_data_index(n, row, i)];
            let phys = stripe.offset + row * stripe_len as u64;
            DispatchContext::write_now(
                stripe.dev_id,
                device(devices, stripe.dev_id)?.io.as_ref(),
                phys,
                buf,
            )?;
        }
        let pstripe = &chunk.stripes[parity_index(n, 1, row)];
        DispatchContext::write_now(
            pstripe.dev_id,
            device(devices, pstripe.dev_id)?.io.as_ref(),
            pstripe.offset + row * stripe_len as u64,
            &parity,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use crate::storage::chunk::block_group;
    use crate::storage::records::{DevItem, StripeRecord};
    use crate::storage::space::SpaceList;
    use std::sync::Arc;

    fn chunk(profile: Profile, devs: u64, sub: u16) -> Chunk {
        let stripes = (0..devs)
            .map(|d| StripeRecord {
                dev_id: d + 1,
                offset: 1 << 20,
                dev_uuid: [0; 16],
            })
            .collect();
        let item = crate::storage::records::ChunkItem {
            length: 1 << 20,
            owner: 2,
            stripe_len: 65536,
            chunk_type: block_group::DATA | profile.flags(),
            io_align: 65536,
            io_width: 65536,
            sector_size: 4096,
            sub_stripes: sub,
            stripes,
        };
        Chunk::from_item(1 << 30, &item)
    }

    fn devices(n: u64) -> Vec<Device> {
        (1..=n)
            .map(|id| Device {
                item: DevItem {
                    dev_id: id,
                    total_bytes: 8 << 20,
                    ..DevItem::default()
                },
                io: Arc::new(MemFileIo::new(8 << 20)),
                free: SpaceList::new(),
            })
            .collect()
    }

    #[test]
    fn mirrored_write_reaches_both_copies() {
        let c = chunk(Profile::Raid1, 2, 0);
        let map = map_write(&c, (1 << 30) + 4096, 4096).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.iter().all(|p| p.physical == (1 << 20) + 4096));
        assert_eq!(map_read(&c, (1 << 30) + 4096, 4096).unwrap().len(), 1);
    }

    #[test]
    fn raid0_splits_at_stripe_boundary() {
        let c = chunk(Profile::Raid0, 2, 0);
        let map = map_write(&c, (1 << 30) + 65536 - 1024, 2048).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[0].dev_id, 1);
        assert_eq!(map[1].dev_id, 2);
        assert_eq!(map[1].physical, 1 << 20);
        assert_eq!(map[1].buf_offset, 1024);
    }

    #[test]
    fn raid5_write_updates_parity() {
        let c = chunk(Profile::Raid5, 3, 0);
        let devs = devices(3);
        let payload = vec![0x5a; 8192];
        write_parity(&c, &devs, (1 << 30) + 4096, &payload).unwrap();
        let mut back = vec![0u8; 8192];
        read_logical(&c, &devs, (1 << 30) + 4096, &mut back).unwrap();
        assert_eq!(back, payload);

        // Row 0: data stripes on devices 1 and 2, parity on device 3.
        let mut parity = vec![0u8; 8192];
        devs[2].io.read_at((1 << 20) + 4096, &mut parity).unwrap();
        assert_eq!(parity, payload);
        assert_eq!(parity_row(&c, (1 << 30) + 131072), 1);
        assert!(map_write(&c, 1 << 30, 16).is_err());
    }
}
