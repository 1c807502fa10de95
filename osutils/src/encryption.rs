use std::path::Path;

use crate::dependencies::{Command, Dependency};

/// Cipher specification string for the LUKS2 data segment.
pub const CIPHER: &str = "aes-xts-plain64";

/// Key size in bits, limited by the cipher specification.
pub const KEY_SIZE: &str = "512";

/// Initializes LUKS2 encryption on `device`, unlocked by `key_file`.
pub fn luks_format(device: &str, key_file: &Path, uuid: Option<&str>) -> Command {
    let mut cmd = Dependency::Cryptsetup.cmd();
    cmd.arg("luksFormat")
        .arg("--batch-mode")
        .arg("--type")
        .arg("luks2")
        .arg("--cipher")
        .arg(CIPHER)
        .arg("--key-size")
        .arg(KEY_SIZE)
        .arg("--key-file")
        .arg(key_file);
    if let Some(uuid) = uuid {
        cmd.arg("--uuid").arg(uuid);
    }
    cmd.with_arg(device)
}

/// Opens an encrypted device as `/dev/mapper/<dm_table_name>`.
pub fn open(device: &str, dm_table_name: &str, key_file: &Path) -> Command {
    Dependency::Cryptsetup
        .cmd()
        .with_args(["open", "--type", "luks2", "--key-file"])
        .with_arg(key_file)
        .with_args([device, dm_table_name])
}

pub fn close(dm_table_name: &str) -> Command {
    Dependency::Cryptsetup.cmd().with_args(["close", dm_table_name])
}
