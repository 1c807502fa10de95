use const_format::formatcp;

// Size units

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

// Device paths

/// Directory holding device nodes.
pub const DEV_PATH: &str = "/dev";

/// Directory holding named MD arrays, e.g. `/dev/md/foo`.
pub const DEV_MD_PATH: &str = formatcp!("{DEV_PATH}/md");

/// Directory holding device mapper nodes.
pub const DEV_MAPPER_PATH: &str = formatcp!("{DEV_PATH}/mapper");

/// Root volume mount point path.
pub const ROOT_MOUNT_POINT_PATH: &str = "/";

// Sid allocation

/// First sid handed out by a fresh process.
pub const FIRST_SID: u32 = 42;

// Persisted document

/// Newest devicegraph document version this build reads and writes.
pub const DOCUMENT_VERSION: u32 = 1;

// MD RAID

/// Metadata format used for every array created by blkplan.
pub const MD_DEFAULT_METADATA: &str = "1.0";

/// Chunk size used when the array does not configure one.
pub const MD_DEFAULT_CHUNK_SIZE: u64 = 512 * KIB;

/// RAID1 has no chunks, mdadm reports and uses 64 KiB for the bitmap.
pub const MD_RAID1_CHUNK_SIZE: u64 = 64 * KIB;

/// Space reserved at the end of each member for v1.0 metadata.
pub const MD_METADATA_RESERVED: u64 = 8 * KIB;

/// Upper bound of the extra space mdadm keeps back on each member.
pub const MD_MAX_EXTRA_RESERVED: u64 = 128 * MIB;

// LUKS

/// Space taken by the LUKS2 header in front of the payload.
pub const LUKS_HEADER_SIZE: u64 = 16 * MIB;

// LVM

/// Default physical extent size of a new volume group.
pub const LVM_DEFAULT_EXTENT_SIZE: u64 = 4 * MIB;

/// Longest name LVM accepts for volume groups and logical volumes.
pub const LVM_MAX_NAME_LENGTH: usize = 127;

// Partition ids

pub const PARTITION_ID_LINUX: u32 = 0x83;
pub const PARTITION_ID_SWAP: u32 = 0x82;
pub const PARTITION_ID_LVM: u32 = 0x8e;
pub const PARTITION_ID_RAID: u32 = 0xfd;
pub const PARTITION_ID_ESP: u32 = 0xef;
