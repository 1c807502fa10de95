use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::devicegraph::Sid;

/// A device, holder or document did not satisfy the model's rules.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationError {
    #[error("Invalid {device_type} name '{name}'")]
    InvalidName { device_type: String, name: String },
    #[error("Invalid partition number {number} for '{name}'")]
    InvalidPartitionNumber { name: String, number: u32 },
    #[error("Label '{label}' is longer than the {max} characters {fs_type} allows")]
    InvalidLabel {
        label: String,
        fs_type: String,
        max: usize,
    },
    #[error("Mount point path '{path}' is not absolute")]
    InvalidMountPath { path: String },
    #[error("Subvolume path '{path}' must be relative")]
    InvalidSubvolumePath { path: String },
    #[error("Region {start}+{length} does not fit on '{name}' of size {size}")]
    RegionOutOfBounds {
        name: String,
        start: u64,
        length: u64,
        size: u64,
    },
    #[error("Disk '{disk}' has no partition table")]
    MissingPartitionTable { disk: String },
    #[error("Device {sid} is a {found}, expected {expected}")]
    WrongDeviceType {
        sid: Sid,
        expected: String,
        found: String,
    },
    #[error("Device {sid} is not a block device")]
    NotABlockDevice { sid: Sid },
    #[error("No free numeric MD name left")]
    NoFreeMdName,
    #[error("Encryption layer '{device}' has no key file")]
    MissingKeyFile { device: String },
    #[error("Partition id {id:#x} of '{device}' has no GPT partition type")]
    UnsupportedPartitionId { device: String, id: u32 },
    #[error("Failed to read configuration file '{path}'")]
    ReadConfig { path: String },
    #[error("Failed to parse configuration file '{path}'")]
    ParseConfig { path: String },
    #[error("Devicegraph document version {found} is newer than supported version {supported}")]
    UnsupportedDocumentVersion { found: u32, supported: u32 },
    #[error("Failed to parse devicegraph document")]
    ParseDocument,
    #[error("Failed to serialize devicegraph document")]
    SerializeDocument,
}

/// The devicegraph or actiongraph structure is broken.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum GraphConsistencyError {
    #[error("Device {sid} not found")]
    DeviceNotFound { sid: Sid },
    #[error("No device named '{name}'")]
    DeviceNameNotFound { name: String },
    #[error("Holder {parent} -> {child} not found")]
    HolderNotFound { parent: Sid, child: Sid },
    #[error("Sid {sid} is already in use")]
    DuplicateSid { sid: Sid },
    #[error("Holder {parent} -> {child} already exists")]
    DuplicateHolder { parent: Sid, child: Sid },
    #[error("A {holder_type} holder cannot connect a {source_type} to a {target_type}")]
    InvalidHolderEndpoints {
        holder_type: String,
        source_type: String,
        target_type: String,
    },
    #[error("Device '{name}' ({sid}) already has a consumer")]
    ExclusiveConsumer { sid: Sid, name: String },
    #[error("Holder {parent} -> {child} would create a cycle")]
    HolderCycle { parent: Sid, child: Sid },
    #[error("Actiongraph contains a cycle")]
    ActiongraphCycle,
}

/// The staging graph asks for a change that cannot be applied to existing
/// storage.
#[derive(Debug, Clone, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum UnsupportedChangeError {
    #[error("Cannot rename '{device}'")]
    CannotRename { device: String },
    #[error("Cannot change the size of '{device}'")]
    CannotResize { device: String },
    #[error("Cannot move '{device}'")]
    CannotMove { device: String },
    #[error("Cannot change RAID level of '{device}'")]
    CannotChangeLevel { device: String },
    #[error("Cannot change parity of '{device}'")]
    CannotChangeParity { device: String },
    #[error("Cannot change metadata of '{device}'")]
    CannotChangeMetadata { device: String },
    #[error("Cannot change chunk size of '{device}'")]
    CannotChangeChunkSize { device: String },
    #[error("Cannot change uuid of '{device}'")]
    CannotChangeUuid { device: String },
    #[error("Cannot change filesystem type of '{device}'")]
    CannotChangeFilesystemType { device: String },
    #[error("Cannot change the label of {fs_type} on '{device}'")]
    CannotChangeLabel { device: String, fs_type: String },
    #[error("Cannot change existing partition table on '{device}'")]
    CannotChangePartitionTable { device: String },
    #[error("Cannot create {device_type} '{device}'")]
    CannotCreate { device_type: String, device: String },
    #[error("Cannot delete {device_type} '{device}'")]
    CannotDelete { device_type: String, device: String },
    #[error("Cannot modify '{device}'")]
    CannotModify { device: String },
    #[error("Cannot create subvolume '{path}' on a btrfs without mount point")]
    SubvolumeWithoutMountPoint { path: String },
    #[error("Cannot unset default flag of subvolume '{path}'")]
    CannotUnsetDefaultSubvolume { path: String },
    #[error("Cannot change holder {parent} -> {child}")]
    CannotChangeHolder { parent: Sid, child: Sid },
    #[error("Cannot add or remove members of '{device}'")]
    CannotReallot { device: String },
    #[error("'{device}' needs at least {required} members, only {remaining} would remain")]
    TooFewMembers {
        device: String,
        required: usize,
        remaining: usize,
    },
}

/// An external tool or configuration update failed while committing or
/// probing.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CommandFailureError {
    #[error("Required binary '{binary}' not found")]
    MissingBinary { binary: String },
    #[error("Command '{command}' failed")]
    CommandFailed { command: String },
    #[error("Failed to parse output of '{command}'")]
    ParseOutput { command: String },
    #[error("Failed to update mdadm configuration")]
    UpdateEtcMdadm,
    #[error("Failed to query uuid of '{device}'")]
    QueryUuid { device: String },
    #[error("Failed to probe {what}")]
    Probe { what: String },
}

/// A bug in blkplan itself.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum LogicError {
    #[error("Device {sid} changed its type between snapshots")]
    DeviceTypeChanged { sid: Sid },
    #[error("Precondition of action '{action}' does not hold")]
    SimulationFailed { action: String },
    #[error("Simulated devicegraph does not match the staging devicegraph")]
    SimulationMismatch,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Each variant of `ErrorKind` corresponds to a different category of error.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// A device, holder or document was rejected when entering the model.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Edges, sids or the action dependencies are inconsistent.
    #[error(transparent)]
    GraphConsistency(#[from] GraphConsistencyError),

    /// The requested transformation cannot be planned. Aborts plan generation.
    #[error(transparent)]
    UnsupportedChange(#[from] UnsupportedChangeError),

    /// An external command failed. Aborts the remaining commit sequence.
    #[error(transparent)]
    CommandFailure(#[from] CommandFailureError),

    /// Should never happen, indicates a bug.
    #[error(transparent)]
    Logic(#[from] LogicError),
}

#[derive(Debug)]
struct BlkplanErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct BlkplanError(Box<BlkplanErrorInner>);
impl BlkplanError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        BlkplanError(Box::new(BlkplanErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        BlkplanError(Box::new(BlkplanErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured BlkplanError.
    fn structured(self, kind: K) -> Result<T, BlkplanError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, BlkplanError> {
        match self {
            Some(t) => Ok(t),
            None => Err(BlkplanError(Box::new(BlkplanErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, BlkplanError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(BlkplanError(Box::new(BlkplanErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait BlkplanResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, BlkplanError>;

    /// Convert the error into an unstructured error.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}
impl<T> BlkplanResultExt<T> for Result<T, BlkplanError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, BlkplanError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Serialize for BlkplanError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("blkplan-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Validation(ref e) => state.serialize_field("error", e)?,
            ErrorKind::GraphConsistency(ref e) => state.serialize_field("error", e)?,
            ErrorKind::UnsupportedChange(ref e) => state.serialize_field("error", e)?,
            ErrorKind::CommandFailure(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Logic(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for BlkplanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            let mut index = 0;
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_yaml::Value;

    use super::*;

    #[test]
    fn test_error_serialize() {
        let e = BlkplanError(Box::new(BlkplanErrorInner {
            kind: ErrorKind::CommandFailure(CommandFailureError::MissingBinary {
                binary: "mdadm".into(),
            }),
            location: Location::caller(),
            source: Some(
                std::fs::read("/non-existant-file")
                    .context("failed to read file")
                    .unwrap_err(),
            ),
            context: Vec::new(),
        }));
        match serde_yaml::to_value(e).unwrap() {
            Value::Mapping(m) => {
                assert_eq!(m.len(), 5);
                assert!(matches!(m["error"], Value::Mapping(_)));
                assert_eq!(m["category"], Value::String("command-failure".into()));
                assert!(matches!(m["cause"], Value::String(_)));
                assert_eq!(
                    m["message"],
                    Value::String("Required binary 'mdadm' not found".into())
                );
                match m["location"] {
                    Value::String(ref s) => assert!(s.contains("error.rs:")),
                    _ => panic!("location isn't string"),
                }
            }
            _ => panic!("value isn't mapping"),
        }
    }

    #[test]
    fn test_unit_variant_serialize() {
        let e = BlkplanError::new(GraphConsistencyError::ActiongraphCycle);
        let value = serde_yaml::to_value(e).unwrap();
        assert_eq!(value["error"], Value::String("actiongraph-cycle".into()));
        assert_eq!(value["category"], Value::String("graph-consistency".into()));
        assert_eq!(value["cause"], Value::Null);
    }

    #[test]
    fn test_error_debug() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(LogicError::Internal("w".into()))
            .unwrap_err();
        assert_eq!(
            format!("{:?}", error),
            format!(
                "Internal error: w at {}:{}\n\nCaused by:\n    0: x\n       y\n    1: z\n",
                error.0.location.file(),
                error.0.location.line(),
            ),
        );
    }

    #[test]
    fn test_error_message_context() {
        let error = Err::<(), _>(BlkplanError::new(LogicError::SimulationMismatch))
            .message("while simulating")
            .unwrap_err();
        let debug = format!("{:?}", error);
        assert!(debug.starts_with("Simulated devicegraph does not match"));
        assert!(debug.contains("Context:\n    0: while simulating at"));
        assert!(matches!(
            error.kind(),
            ErrorKind::Logic(LogicError::SimulationMismatch)
        ));
    }
}
