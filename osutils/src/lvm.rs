use anyhow::{Context, Error};
use serde::{de::DeserializeOwned, Deserialize};

use blkplan_api::constants::KIB;

use crate::dependencies::{Command, Dependency};

pub fn pvcreate(device: &str) -> Command {
    Dependency::Pvcreate.cmd().with_args(["--yes", device])
}

pub fn pvremove(device: &str) -> Command {
    Dependency::Pvremove.cmd().with_args(["--yes", device])
}

pub fn vgcreate(vg_name: &str, extent_size: u64, pvs: &[&str]) -> Command {
    Dependency::Vgcreate
        .cmd()
        .with_args(["--yes", "--physicalextentsize"])
        .with_arg(format!("{}k", extent_size / KIB))
        .with_arg(vg_name)
        .with_args(pvs)
}

pub fn vgremove(vg_name: &str) -> Command {
    Dependency::Vgremove.cmd().with_args(["--yes", vg_name])
}

pub fn vgextend(vg_name: &str, pv: &str) -> Command {
    Dependency::Vgextend.cmd().with_args([vg_name, pv])
}

pub fn vgreduce(vg_name: &str, pv: &str) -> Command {
    Dependency::Vgreduce.cmd().with_args([vg_name, pv])
}

pub fn vgrename(old: &str, new: &str) -> Command {
    Dependency::Vgrename.cmd().with_args([old, new])
}

pub fn lvcreate(vg_name: &str, lv_name: &str, size: u64, stripes: u32) -> Command {
    let mut cmd = Dependency::Lvcreate
        .cmd()
        .with_args(["--yes", "--wipesignatures", "y", "--name", lv_name, "--size"])
        .with_arg(format!("{size}b"));
    if stripes > 1 {
        cmd.arg("--stripes").arg(stripes.to_string());
    }
    cmd.with_arg(vg_name)
}

pub fn lvremove(vg_name: &str, lv_name: &str) -> Command {
    Dependency::Lvremove
        .cmd()
        .with_arg("--yes")
        .with_arg(format!("{vg_name}/{lv_name}"))
}

pub fn lvrename(vg_name: &str, old: &str, new: &str) -> Command {
    Dependency::Lvrename.cmd().with_args([vg_name, old, new])
}

fn report(dependency: Dependency, fields: &str) -> Command {
    dependency.cmd().with_args([
        "--reportformat",
        "json",
        "--units",
        "b",
        "--nosuffix",
        "--options",
        fields,
    ])
}

pub fn pvs() -> Command {
    report(Dependency::Pvs, "pv_name,vg_name,pv_uuid")
}

pub fn vgs() -> Command {
    report(Dependency::Vgs, "vg_name,vg_uuid,vg_extent_size")
}

pub fn lvs() -> Command {
    report(Dependency::Lvs, "lv_name,vg_name,lv_uuid,lv_size,stripes,lv_dm_path")
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PvReport {
    pub pv_name: String,
    pub vg_name: String,
    pub pv_uuid: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VgReport {
    pub vg_name: String,
    pub vg_uuid: String,
    #[serde(deserialize_with = "number")]
    pub vg_extent_size: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LvReport {
    pub lv_name: String,
    pub vg_name: String,
    pub lv_uuid: String,
    #[serde(deserialize_with = "number")]
    pub lv_size: u64,
    #[serde(deserialize_with = "number")]
    pub stripes: u32,
    pub lv_dm_path: String,
}

/// The LVM tools report numbers as strings.
fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = String::deserialize(deserializer)?;
    value.trim().parse().map_err(serde::de::Error::custom)
}

/// Everything known to LVM on this system.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LvmReport {
    pub pvs: Vec<PvReport>,
    pub vgs: Vec<VgReport>,
    pub lvs: Vec<LvReport>,
}

/// Parses the json report of `pvs`, `vgs` or `lvs`, `key` is the section
/// name (`pv`, `vg` or `lv`).
pub fn parse_report<T: DeserializeOwned>(output: &str, key: &str) -> Result<Vec<T>, Error> {
    let value: serde_json::Value =
        serde_json::from_str(output).context("Failed to parse LVM report")?;
    let Some(reports) = value.get("report").and_then(|r| r.as_array()) else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::new();
    for report in reports {
        if let Some(section) = report.get(key) {
            let section: Vec<T> = serde_json::from_value(section.clone())
                .with_context(|| format!("Failed to parse '{key}' section of LVM report"))?;
            rows.extend(section);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use blkplan_api::constants::MIB;
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_commands() {
        assert_eq!(
            vgcreate("system", 4 * MIB, &["/dev/sda2", "/dev/sdb2"]).render(),
            "vgcreate --yes --physicalextentsize 4096k system /dev/sda2 /dev/sdb2"
        );
        assert_eq!(
            lvcreate("system", "root", 10 * MIB, 1).render(),
            "lvcreate --yes --wipesignatures y --name root --size 10485760b system"
        );
        assert_eq!(
            lvcreate("system", "data", MIB, 2).render(),
            "lvcreate --yes --wipesignatures y --name data --size 1048576b --stripes 2 system"
        );
        assert_eq!(lvremove("system", "root").render(), "lvremove --yes system/root");
        assert_eq!(vgrename("system", "data").render(), "vgrename system data");
        assert_eq!(
            lvs().render(),
            "lvs --reportformat json --units b --nosuffix --options \
             lv_name,vg_name,lv_uuid,lv_size,stripes,lv_dm_path"
        );
    }

    #[test]
    fn test_parse_report() {
        let output = indoc! {r#"
            {
                "report": [
                    {
                        "lv": [
                            {"lv_name":"root", "vg_name":"system", "lv_uuid":"kXy1Ab-0000-1111-2222-3333-4444-555566", "lv_size":"10737418240", "stripes":"1", "lv_dm_path":"/dev/mapper/system-root"}
                        ]
                    }
                ]
            }
        "#};
        let lvs: Vec<LvReport> = parse_report(output, "lv").unwrap();
        assert_eq!(
            lvs,
            [LvReport {
                lv_name: "root".into(),
                vg_name: "system".into(),
                lv_uuid: "kXy1Ab-0000-1111-2222-3333-4444-555566".into(),
                lv_size: 10737418240,
                stripes: 1,
                lv_dm_path: "/dev/mapper/system-root".into(),
            }]
        );

        let vgs: Vec<VgReport> = parse_report(
            r#"{"report":[{"vg":[{"vg_name":"system","vg_uuid":"abc","vg_extent_size":"4194304"}]}]}"#,
            "vg",
        )
        .unwrap();
        assert_eq!(vgs[0].vg_extent_size, 4 * MIB);

        let pvs: Vec<PvReport> = parse_report(r#"{"report":[{"pv":[]}]}"#, "pv").unwrap();
        assert!(pvs.is_empty());

        parse_report::<PvReport>(r#"{"report":[{"pv":[{"pv_name":1}]}]}"#, "pv").unwrap_err();
    }
}
