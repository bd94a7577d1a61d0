//! Workload input: whitespace-delimited text traces and CSV traces, plus
//! the workflow-kind to access-type profiles.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::{
    error::{Result, SimError},
    resolver::{parse_list_literal, Resolver},
    workflow::{AccessRequest, AccessType, Workflow},
};

/// How access types are assigned while loading a text trace.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TraceAccess {
    ForceRead,
    ForceWrite,
    /// Resolve per workflow kind through an [`AccessProfile`].
    #[default]
    PerKind,
}

/// The four name→access mappings shipped with the trace data.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AccessProfile {
    Standard,
    WriteHeavy,
    Balanced,
    #[default]
    ReadHeavy,
}

/// The workflow kinds the traces contain.
const KINDS: [&str; 11] = [
    "cableguy_ping_test",
    "bb_circuit_turnup",
    "vmhandler",
    "dne_device_state_change",
    "device_data_audit",
    "drain_undrain_devices",
    "ens_ops_breakfix_base_workflow",
    "collection_analysis_troubleshooting",
    "px_lock_and_push_to_routers_sub",
    "dc_matryoshka_configen_runner",
    "rdam_dc",
];

impl AccessProfile {
    pub fn access_for(self, kind: &str) -> Option<AccessType> {
        use AccessType::{Read, Write};
        if !KINDS.contains(&kind) {
            return None;
        }
        Some(match self {
            AccessProfile::Standard => match kind {
                "cableguy_ping_test"
                | "device_data_audit"
                | "ens_ops_breakfix_base_workflow"
                | "collection_analysis_troubleshooting"
                | "rdam_dc" => Read,
                _ => Write,
            },
            AccessProfile::WriteHeavy => match kind {
                "cableguy_ping_test" => Read,
                _ => Write,
            },
            AccessProfile::Balanced => match kind {
                "cableguy_ping_test" | "device_data_audit" | "rdam_dc" => Read,
                _ => Write,
            },
            AccessProfile::ReadHeavy => match kind {
                "bb_circuit_turnup" | "vmhandler" | "dc_matryoshka_configen_runner" => Write,
                _ => Read,
            },
        })
    }
}

/// One loaded trace row, ready to be seeded into the event queue.
#[derive(Debug)]
pub struct LoadedRow {
    pub workflow: Workflow,
    pub start_time: f64,
    pub exec_time: f64,
    pub regex: String,
}

/// Load a workload file; the format is chosen by extension (`.csv` or
/// whitespace-delimited text).
pub fn load(
    path: &Path,
    trace_access: TraceAccess,
    profile: AccessProfile,
    rl: &Resolver,
) -> Result<Vec<LoadedRow>> {
    if path.extension().and_then(|e| e.to_str()) == Some("csv") {
        load_csv(path)
    } else {
        load_text(path, trace_access, profile, rl)
    }
}

fn load_text(
    path: &Path,
    trace_access: TraceAccess,
    profile: AccessProfile,
    rl: &Resolver,
) -> Result<Vec<LoadedRow>> {
    let text = std::fs::read_to_string(path).map_err(|e| SimError::io(path, e))?;
    let mut rows = Vec::new();
    let mut reads = 0usize;
    let mut single_dev = 0usize;
    for (i, line) in text.lines().enumerate() {
        let bad_row = |reason: &str| SimError::WorkloadRow {
            path: path.to_owned(),
            line: i + 1,
            reason: reason.to_owned(),
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [start_time, wf_name, exec_time, regex] = fields.as_slice() else {
            return Err(bad_row("expected `start_time wf_name exec_time regex`"));
        };
        let start_time: i64 = start_time
            .parse()
            .map_err(|_| bad_row("start_time is not an integer"))?;
        let exec_time: i64 = exec_time
            .parse()
            .map_err(|_| bad_row("exec_time is not an integer"))?;

        if rl.is_known_device(&regex.replace("\\.", ".")) {
            single_dev += 1;
        }
        let access = match trace_access {
            TraceAccess::ForceRead => AccessType::Read,
            TraceAccess::ForceWrite => AccessType::Write,
            TraceAccess::PerKind => profile
                .access_for(wf_name)
                .ok_or_else(|| SimError::UnknownAccessType((*wf_name).to_owned()))?,
        };
        if access == AccessType::Read {
            reads += 1;
        }
        let workflow = Workflow::new(
            format!("{start_time}_{wf_name}"),
            vec![AccessRequest::new(
                (*regex).to_owned(),
                exec_time as f64,
                access,
            )],
        );
        rows.push(LoadedRow {
            workflow,
            start_time: start_time as f64,
            exec_time: exec_time as f64,
            regex: (*regex).to_owned(),
        });
    }
    if !rows.is_empty() {
        info!(
            reads,
            ratio = reads as f64 / rows.len() as f64,
            single_dev,
            total = rows.len(),
            "workload loaded"
        );
    }
    Ok(rows)
}

#[derive(Deserialize)]
struct CsvRow {
    start_time: i64,
    wf_name: String,
    exec_time: i64,
    regex: String,
    device_list: String,
}

fn load_csv(path: &Path) -> Result<Vec<LoadedRow>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        SimError::Config(format!("cannot read workload {path:?}: {e}"))
    })?;
    let mut rows = Vec::new();
    for (i, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row.map_err(|e| SimError::WorkloadRow {
            path: path.to_owned(),
            line: i + 2,
            reason: e.to_string(),
        })?;
        // The device list is carried for trace tooling; only its shape is
        // validated here.
        let _devices = parse_list_literal(&row.device_list);
        let workflow = Workflow::new(
            format!("{}_{}", row.start_time, row.wf_name),
            vec![AccessRequest::new(
                row.regex.clone(),
                row.exec_time as f64,
                AccessType::Write,
            )],
        );
        rows.push(LoadedRow {
            workflow,
            start_time: row.start_time as f64,
            exec_time: row.exec_time as f64,
            regex: row.regex,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn profiles_disagree_on_audit_workflows() {
        assert_eq!(
            AccessProfile::ReadHeavy.access_for("drain_undrain_devices"),
            Some(AccessType::Read)
        );
        assert_eq!(
            AccessProfile::Standard.access_for("drain_undrain_devices"),
            Some(AccessType::Write)
        );
        assert_eq!(AccessProfile::Balanced.access_for("nonsense"), None);
    }

    #[test]
    fn text_trace_round_trips() {
        let rl = Resolver::in_memory(["d0dc1", "d1dc1"], ["dc1"]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 vmhandler 10 d0dc1").unwrap();
        writeln!(file, "5 rdam_dc 2 d[0-1]dc1").unwrap();
        let rows = load(
            file.path(),
            TraceAccess::PerKind,
            AccessProfile::ReadHeavy,
            &rl,
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].workflow.name, "0_vmhandler");
        assert_eq!(rows[0].workflow.current().access, AccessType::Write);
        assert_eq!(rows[1].workflow.current().access, AccessType::Read);
        assert_eq!(rows[1].start_time, 5.0);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let rl = Resolver::in_memory(["d0dc1"], ["dc1"]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 mystery_workflow 10 d0dc1").unwrap();
        let err = load(
            file.path(),
            TraceAccess::PerKind,
            AccessProfile::ReadHeavy,
            &rl,
        )
        .unwrap_err();
        assert!(matches!(err, SimError::UnknownAccessType(name) if name == "mystery_workflow"));
    }

    #[test]
    fn csv_trace_is_always_write() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "start_time,wf_name,exec_time,regex,device_list").unwrap();
        writeln!(file, "3,vmhandler,7,d0dc1,\"['d0dc1']\"").unwrap();
        let rl = Resolver::in_memory(["d0dc1"], ["dc1"]);
        let rows = load(
            file.path(),
            TraceAccess::PerKind,
            AccessProfile::ReadHeavy,
            &rl,
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].workflow.current().access, AccessType::Write);
        assert_eq!(rows[0].exec_time, 7.0);
    }
}
