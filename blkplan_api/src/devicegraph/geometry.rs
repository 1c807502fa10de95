//! Derived sizes of devices whose size follows from the devices below them.

use std::cmp::min;

use log::trace;

use crate::{
    constants::{KIB, LUKS_HEADER_SIZE, MD_MAX_EXTRA_RESERVED, MD_METADATA_RESERVED},
    error::BlkplanError,
};

use super::{device::DeviceKind, holder::HolderKind, kinds::MdLevel, Devicegraph, Sid};

/// Usable size of a single member of size `size`: aligned down to 4 KiB,
/// minus the v1.0 superblock area, minus up to 128 MiB (roughly 1.5%) for
/// the bitmap, rounded down to a whole number of chunks.
///
/// This is a conservative estimate. A size too big causes problems later,
/// e.g. a partition that no longer fits.
pub fn md_member_usable_size(size: u64, chunk_size: u64) -> u64 {
    let mut size = (size & !(4 * KIB - 1)).saturating_sub(MD_METADATA_RESERVED);
    size -= min(MD_MAX_EXTRA_RESERVED, size / 64);
    if chunk_size > 0 {
        size -= size % chunk_size;
    }
    size
}

/// Computes size and optimal I/O size of an array. `members` holds the size
/// of each member and whether it is a spare. Spares only count towards the
/// smallest member.
pub fn md_size_and_optimal_io(level: MdLevel, chunk_size: u64, members: &[(u64, bool)]) -> (u64, u64) {
    let mut number: u64 = 0;
    let mut sum: u64 = 0;
    let mut smallest = u64::MAX;

    for (size, spare) in members {
        let size = md_member_usable_size(*size, chunk_size);
        if !spare {
            number += 1;
            sum += size;
        }
        smallest = min(smallest, size);
    }

    if number < level.minimal_number_of_devices() as u64 {
        return (0, 0);
    }

    match level {
        MdLevel::Raid0 => (sum, chunk_size * number),
        MdLevel::Raid1 => (smallest, 0),
        MdLevel::Raid4 | MdLevel::Raid5 => (smallest * (number - 1), chunk_size * (number - 1)),
        MdLevel::Raid6 => (smallest * (number - 2), chunk_size * (number - 2)),
        MdLevel::Raid10 => {
            let size = ((smallest / chunk_size) * number / 2) * chunk_size;
            let mut optimal_io = chunk_size * number / 2;
            if number % 2 == 1 {
                optimal_io *= 2;
            }
            (size, optimal_io)
        }
    }
}

impl Devicegraph {
    /// Recomputes the region of an MD array or LUKS device from the devices
    /// below it and continues upwards when the size changed. Devices found on
    /// the system keep their probed size.
    pub(crate) fn recalculate(&mut self, sid: Sid) -> Result<(), BlkplanError> {
        let device = self.find_device(sid)?;
        if device.exists_in_probed {
            return Ok(());
        }

        let (size, optimal_io) = match &device.kind {
            DeviceKind::Md(md) => {
                let members = self
                    .in_holders(sid)?
                    .into_iter()
                    .filter_map(|holder| match holder.kind {
                        HolderKind::MdUser(md_user) => Some((holder.source, md_user.spare)),
                        _ => None,
                    })
                    .map(|(source, spare)| {
                        let size = self
                            .find_device(source)?
                            .blk()
                            .map(|blk| blk.size())
                            .unwrap_or_default();
                        Ok((size, spare))
                    })
                    .collect::<Result<Vec<_>, BlkplanError>>()?;
                let (size, optimal_io) =
                    md_size_and_optimal_io(md.level, md.effective_chunk_size(), &members);
                (size, Some(optimal_io))
            }
            DeviceKind::Luks(_) => {
                let backing = self
                    .parents(sid)?
                    .into_iter()
                    .find_map(|parent| parent.blk().map(|blk| blk.size()))
                    .unwrap_or_default();
                (backing.saturating_sub(LUKS_HEADER_SIZE), None)
            }
            _ => return Ok(()),
        };

        let device = self.find_device_mut(sid)?;
        let mut changed = false;
        if let Some(blk) = device.blk_mut() {
            changed = blk.region.length != size;
            blk.region.length = size;
        }
        if let (Some(md), Some(optimal_io)) = (device.as_md_mut(), optimal_io) {
            md.optimal_io_size = optimal_io;
        }

        if changed {
            trace!("Size of device {sid} is now {size}");
            for child in self.child_sids(sid)? {
                self.recalculate(child)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::constants::{GIB, MIB};

    use super::*;

    #[test]
    fn test_member_usable_size() {
        // 16 GiB: 8 KiB superblock, 128 MiB bitmap, one more chunk dropped by
        // the alignment.
        assert_eq!(
            md_member_usable_size(16 * GIB, 512 * KIB),
            16 * GIB - 128 * MIB - 512 * KIB
        );

        // Small devices lose 1/64 instead of 128 MiB.
        let size = 64 * MIB;
        let expected = {
            let s = size - 8 * KIB;
            let s = s - s / 64;
            s - s % (512 * KIB)
        };
        assert_eq!(md_member_usable_size(size, 512 * KIB), expected);

        assert_eq!(md_member_usable_size(4 * KIB, 512 * KIB), 0);
    }

    #[test]
    fn test_raid0() {
        let s = md_member_usable_size(16 * GIB, 512 * KIB);
        let members = vec![(16 * GIB, false); 4];
        assert_eq!(
            md_size_and_optimal_io(MdLevel::Raid0, 512 * KIB, &members),
            (4 * s, 4 * 512 * KIB)
        );
    }

    #[test]
    fn test_raid1_uses_smallest() {
        let members = [(8 * GIB, false), (16 * GIB, false)];
        assert_eq!(
            md_size_and_optimal_io(MdLevel::Raid1, 64 * KIB, &members),
            (8 * GIB - 128 * MIB - 64 * KIB, 0)
        );
    }

    #[test]
    fn test_raid5() {
        let s = md_member_usable_size(16 * GIB, 512 * KIB);
        let members = vec![(16 * GIB, false); 4];
        assert_eq!(
            md_size_and_optimal_io(MdLevel::Raid5, 512 * KIB, &members),
            (3 * s, 3 * 512 * KIB)
        );
    }

    #[test]
    fn test_raid6() {
        let s = md_member_usable_size(16 * GIB, 512 * KIB);
        let members = vec![(16 * GIB, false); 5];
        assert_eq!(
            md_size_and_optimal_io(MdLevel::Raid6, 512 * KIB, &members),
            (3 * s, 3 * 512 * KIB)
        );
    }

    #[test]
    fn test_raid10() {
        let chunk = 512 * KIB;
        let s = md_member_usable_size(16 * GIB, chunk);

        let even = vec![(16 * GIB, false); 4];
        assert_eq!(
            md_size_and_optimal_io(MdLevel::Raid10, chunk, &even),
            (2 * s, 2 * chunk)
        );

        // With an odd number of members the optimal I/O size is doubled.
        let odd = vec![(16 * GIB, false); 3];
        assert_eq!(
            md_size_and_optimal_io(MdLevel::Raid10, chunk, &odd),
            (((s / chunk) * 3 / 2) * chunk, 2 * (chunk * 3 / 2))
        );
    }

    #[test]
    fn test_spares() {
        let s = md_member_usable_size(16 * GIB, 512 * KIB);
        let small = md_member_usable_size(8 * GIB, 512 * KIB);

        // The spare does not add capacity.
        let members = [(16 * GIB, false), (16 * GIB, false), (16 * GIB, true)];
        assert_eq!(
            md_size_and_optimal_io(MdLevel::Raid0, 512 * KIB, &members),
            (2 * s, 2 * 512 * KIB)
        );

        // But a smaller spare limits the smallest member.
        let members = [
            (16 * GIB, false),
            (16 * GIB, false),
            (16 * GIB, false),
            (8 * GIB, true),
        ];
        assert_eq!(
            md_size_and_optimal_io(MdLevel::Raid5, 512 * KIB, &members),
            (2 * small, 2 * 512 * KIB)
        );
    }

    #[test]
    fn test_too_few_members() {
        let members = vec![(16 * GIB, false); 3];
        assert_eq!(
            md_size_and_optimal_io(MdLevel::Raid6, 512 * KIB, &members),
            (0, 0)
        );
        assert_eq!(md_size_and_optimal_io(MdLevel::Raid1, 64 * KIB, &[]), (0, 0));
    }
}
