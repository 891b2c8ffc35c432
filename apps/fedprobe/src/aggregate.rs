//! Deterministic report rows built from dispatch results.
//!
//! Rows are sorted by server name (or join depth for host listings). A
//! target with no result still gets a row carrying an internal error.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::diagnostics::{DiagnosticStep, StepId, StepOutcome};
use crate::dispatch::DispatchReport;
use crate::events::{DeviceList, EventSummary};
use crate::hosts::HostRecord;
use crate::probe::{
    DelegationDiagnosis, KeySet, ProbeFailure, ProbeOutcome, ProbePayload, VersionInfo,
};
use crate::server_name::ServerName;

const MISSING_RESULT: &str = "no result recorded for target";

/// Every submitted target in sorted order with its outcome, synthesising an
/// internal failure for targets the report lacks.
pub fn ordered_outcomes<K, T>(targets: &[K], report: &DispatchReport<K, T>) -> Vec<(K, ProbeOutcome<T>)>
where
    K: Clone + Ord + Hash + Eq,
    T: Clone,
{
    let keys: BTreeSet<&K> = targets.iter().chain(report.results.keys()).collect();
    keys.into_iter()
        .map(|key| {
            let outcome = report
                .results
                .get(key)
                .map(|result| result.outcome.clone())
                .unwrap_or_else(|| ProbeOutcome::Failure(ProbeFailure::internal(MISSING_RESULT)));
            (key.clone(), outcome)
        })
        .collect()
}

fn unexpected_payload(payload: &ProbePayload) -> ProbeFailure {
    let kind = match payload {
        ProbePayload::Version(_) => "version",
        ProbePayload::ServerKeys(_) => "server keys",
        ProbePayload::NotaryKeys(_) => "notary keys",
        ProbePayload::Event(_) => "event",
    };
    ProbeFailure::internal(format!("unexpected {kind} payload"))
}

/// Milliseconds since the epoch as a UTC timestamp.
pub fn format_ts(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("invalid timestamp {ms}"))
}

fn render_table(f: &mut fmt::Formatter<'_>, headers: &[&str], rows: &[Vec<String>]) -> fmt::Result {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    write_row(f, &widths, headers.iter().copied())?;
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    writeln!(f, "{}", rule.join("-+-"))?;
    for row in rows {
        write_row(f, &widths, row.iter().map(String::as_str))?;
    }
    Ok(())
}

fn write_row<'a>(
    f: &mut fmt::Formatter<'_>,
    widths: &[usize],
    cells: impl Iterator<Item = &'a str>,
) -> fmt::Result {
    let rendered: Vec<String> = cells
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect();
    writeln!(f, "{}", rendered.join(" | ").trim_end())
}

fn write_elapsed(f: &mut fmt::Formatter<'_>, elapsed: Duration) -> fmt::Result {
    writeln!(f, "Total time: {:.3} seconds", elapsed.as_secs_f64())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionRow {
    pub server: String,
    pub software: Option<String>,
    pub version: Option<String>,
    pub served_by: Option<String>,
    /// `status:reason` for HTTP errors, the failure message otherwise.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionReport {
    pub rows: Vec<VersionRow>,
    pub total_elapsed: Duration,
}

impl VersionReport {
    pub fn build(targets: &[ServerName], report: &DispatchReport<ServerName, ProbePayload>) -> Self {
        let rows = ordered_outcomes(targets, report)
            .into_iter()
            .map(|(server, outcome)| {
                let info = match outcome {
                    ProbeOutcome::Success(ProbePayload::Version(info)) => Ok(info),
                    ProbeOutcome::Success(other) => Err(unexpected_payload(&other)),
                    ProbeOutcome::Failure(failure) => Err(failure),
                };
                match info {
                    Ok(VersionInfo {
                        software,
                        version,
                        served_by,
                    }) => VersionRow {
                        server: server.to_string(),
                        software,
                        version,
                        served_by,
                        error: None,
                    },
                    Err(failure) => VersionRow {
                        server: server.to_string(),
                        software: None,
                        version: None,
                        served_by: None,
                        error: Some(failure.to_string()),
                    },
                }
            })
            .collect();
        Self {
            rows,
            total_elapsed: report.elapsed,
        }
    }
}

impl fmt::Display for VersionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| match &row.error {
                Some(error) => vec![row.server.clone(), error.clone(), String::new()],
                None => vec![
                    row.server.clone(),
                    row.software.clone().unwrap_or_default(),
                    row.version.clone().unwrap_or_default(),
                ],
            })
            .collect();
        render_table(f, &["Server", "Software", "Version"], &rows)?;
        write_elapsed(f, self.total_elapsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyRow {
    pub server: String,
    pub key_id: Option<String>,
    /// Valid-until for current keys, expiry for old ones.
    pub until: Option<String>,
    pub expired: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyReport {
    pub rows: Vec<KeyRow>,
    pub total_elapsed: Duration,
}

impl KeyReport {
    /// Accepts both server-key and notary-key payloads. Notary responses may
    /// describe several key sets; each contributes its own rows.
    pub fn build(targets: &[ServerName], report: &DispatchReport<ServerName, ProbePayload>) -> Self {
        let mut rows = Vec::new();
        for (server, outcome) in ordered_outcomes(targets, report) {
            match outcome {
                ProbeOutcome::Success(ProbePayload::ServerKeys(keys)) => {
                    key_rows(&server.to_string(), &keys, &mut rows)
                }
                ProbeOutcome::Success(ProbePayload::NotaryKeys(sets)) if sets.is_empty() => {
                    rows.push(error_row(&server, "notary returned no keys"))
                }
                ProbeOutcome::Success(ProbePayload::NotaryKeys(sets)) => {
                    for keys in &sets {
                        key_rows(&server.to_string(), keys, &mut rows);
                    }
                }
                ProbeOutcome::Success(other) => {
                    rows.push(error_row(&server, &unexpected_payload(&other).to_string()))
                }
                ProbeOutcome::Failure(failure) => {
                    rows.push(error_row(&server, &failure.to_string()))
                }
            }
        }
        Self {
            rows,
            total_elapsed: report.elapsed,
        }
    }
}

fn error_row(server: &ServerName, error: &str) -> KeyRow {
    KeyRow {
        server: server.to_string(),
        key_id: None,
        until: None,
        expired: false,
        error: Some(error.to_string()),
    }
}

fn key_rows(server: &str, keys: &KeySet, rows: &mut Vec<KeyRow>) {
    let until = keys.valid_until_ts.map(format_ts);
    for key_id in &keys.verify_keys {
        rows.push(KeyRow {
            server: server.to_string(),
            key_id: Some(key_id.clone()),
            until: until.clone(),
            expired: false,
            error: None,
        });
    }
    for old in &keys.old_verify_keys {
        rows.push(KeyRow {
            server: server.to_string(),
            key_id: Some(old.key_id.clone()),
            until: old.expired_ts.map(format_ts),
            expired: true,
            error: None,
        });
    }
    if keys.verify_keys.is_empty() && keys.old_verify_keys.is_empty() {
        rows.push(KeyRow {
            server: server.to_string(),
            key_id: None,
            until,
            expired: false,
            error: Some("no keys published".into()),
        });
    }
}

impl fmt::Display for KeyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                let (key, until) = match &row.error {
                    Some(error) => (error.clone(), row.until.clone().unwrap_or_default()),
                    None => (
                        row.key_id.clone().unwrap_or_default(),
                        match (&row.until, row.expired) {
                            (Some(ts), true) => format!("expired {ts}"),
                            (Some(ts), false) => ts.clone(),
                            (None, _) => String::new(),
                        },
                    ),
                };
                vec![row.server.clone(), key, until]
            })
            .collect();
        render_table(f, &["Server", "Key ID", "Valid until"], &rows)?;
        write_elapsed(f, self.total_elapsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    Ok,
    Fail,
    NotApplicable,
}

impl Cell {
    pub fn label(self) -> &'static str {
        match self {
            Cell::Ok => "OK",
            Cell::Fail => "FAIL",
            Cell::NotApplicable => "-",
        }
    }

    fn from_steps<'a>(steps: impl Iterator<Item = &'a DiagnosticStep>) -> Self {
        let mut cell = Cell::NotApplicable;
        for step in steps {
            match step.outcome {
                StepOutcome::Ok => return Cell::Ok,
                StepOutcome::Failed => cell = Cell::Fail,
                StepOutcome::Skipped | StepOutcome::NotAttempted => {}
            }
        }
        cell
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelegationRow {
    pub server: String,
    pub endpoint: Option<String>,
    pub well_known: Cell,
    pub srv: Cell,
    pub dns: Cell,
    pub test: Cell,
    pub served_by: Option<String>,
    pub error: Option<String>,
    pub steps: Vec<DiagnosticStep>,
}

impl DelegationRow {
    pub fn from_diagnosis(diagnosis: &DelegationDiagnosis) -> Self {
        let trace = &diagnosis.resolution.trace;
        let steps = trace.steps();
        let pick = |wanted: &[StepId]| {
            Cell::from_steps(steps.iter().filter(|step| wanted.contains(&step.id)))
        };
        let error = diagnosis
            .connectivity_error
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| {
                diagnosis.resolution.endpoint.is_none().then(|| {
                    trace
                        .get(StepId::ServerName)
                        .map(|step| step.detail.clone())
                        .unwrap_or_else(|| "unresolved".into())
                })
            });
        Self {
            server: diagnosis.resolution.server_name.clone(),
            endpoint: diagnosis
                .resolution
                .endpoint
                .as_ref()
                .map(|e| format!("{}:{} ({})", e.host, e.port, e.via)),
            well_known: pick(&[StepId::WellKnown]),
            srv: Cell::from_steps(steps.iter().filter(|step| step.id.is_srv())),
            dns: pick(&[
                StepId::LiteralIp,
                StepId::DnsWithPort,
                StepId::DelegatedLiteralIp,
                StepId::DelegatedDnsWithPort,
                StepId::DelegatedDefaultPort,
                StepId::DefaultPort,
            ]),
            test: pick(&[StepId::Connectivity]),
            served_by: diagnosis.version.as_ref().and_then(|v| v.served_by.clone()),
            error,
            steps: steps.to_vec(),
        }
    }

    fn failed(server: String, failure: &ProbeFailure) -> Self {
        Self {
            server,
            endpoint: None,
            well_known: Cell::NotApplicable,
            srv: Cell::NotApplicable,
            dns: Cell::NotApplicable,
            test: Cell::Fail,
            served_by: None,
            error: Some(failure.to_string()),
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DelegationReport {
    pub rows: Vec<DelegationRow>,
    pub total_elapsed: Duration,
}

impl DelegationReport {
    pub fn build(
        targets: &[ServerName],
        report: &DispatchReport<ServerName, DelegationDiagnosis>,
    ) -> Self {
        let rows = ordered_outcomes(targets, report)
            .into_iter()
            .map(|(server, outcome)| match outcome {
                ProbeOutcome::Success(diagnosis) => DelegationRow::from_diagnosis(&diagnosis),
                ProbeOutcome::Failure(failure) => DelegationRow::failed(server.to_string(), &failure),
            })
            .collect();
        Self {
            rows,
            total_elapsed: report.elapsed,
        }
    }
}

impl fmt::Display for DelegationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                vec![
                    row.server.clone(),
                    row.well_known.label().to_string(),
                    row.srv.label().to_string(),
                    row.dns.label().to_string(),
                    row.test.label().to_string(),
                    row.served_by.clone().unwrap_or_default(),
                    row.error.clone().unwrap_or_default(),
                ]
            })
            .collect();
        render_table(
            f,
            &["Server Name", "WK", "SRV", "DNS", "Test", "TLS served by", "Errors"],
            &rows,
        )?;
        if let [single] = self.rows.as_slice() {
            writeln!(f)?;
            if let Some(endpoint) = &single.endpoint {
                writeln!(f, "Endpoint: {endpoint}")?;
            }
            for step in &single.steps {
                writeln!(
                    f,
                    "  {:<36} {:<13} {}",
                    step.id.label(),
                    step.outcome.label(),
                    step.detail
                )?;
            }
        }
        write_elapsed(f, self.total_elapsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRow {
    pub position: usize,
    pub host: String,
    pub earliest_join_depth: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub room_id: String,
    pub rows: Vec<HostRow>,
}

impl HostReport {
    /// Numbers `hosts` in the order [`order_hosts`](crate::hosts::order_hosts)
    /// produced; positions are 1-based.
    pub fn build(room_id: &str, hosts: &[HostRecord]) -> Self {
        let rows = hosts
            .iter()
            .enumerate()
            .map(|(index, record)| HostRow {
                position: index + 1,
                host: record.host.clone(),
                earliest_join_depth: record.earliest_join_depth,
            })
            .collect();
        Self {
            room_id: room_id.to_string(),
            rows,
        }
    }
}

impl fmt::Display for HostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hosts of {} in approximate join order", self.room_id)?;
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                vec![
                    row.position.to_string(),
                    row.host.clone(),
                    row.earliest_join_depth.to_string(),
                ]
            })
            .collect();
        render_table(f, &["#", "Host", "Depth"], &rows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FindEventRow {
    pub position: usize,
    pub server: String,
    pub found: Cell,
    pub depth: Option<i64>,
    pub error: Option<String>,
}

/// Which of a room's hosts can serve one event, in join order.
#[derive(Debug, Clone, Serialize)]
pub struct FindEventReport {
    pub event_id: String,
    pub rows: Vec<FindEventRow>,
    pub total_elapsed: Duration,
}

impl FindEventReport {
    /// `hosts` keeps its order; it is not re-sorted by name.
    pub fn build(
        event_id: &str,
        hosts: &[ServerName],
        report: &DispatchReport<ServerName, ProbePayload>,
    ) -> Self {
        let rows = hosts
            .iter()
            .enumerate()
            .map(|(index, server)| {
                let outcome = report
                    .results
                    .get(server)
                    .map(|result| result.outcome.clone())
                    .unwrap_or_else(|| ProbeOutcome::Failure(ProbeFailure::internal(MISSING_RESULT)));
                let (found, depth, error) = match outcome {
                    ProbeOutcome::Success(ProbePayload::Event(event)) => (Cell::Ok, event.depth, None),
                    ProbeOutcome::Success(other) => {
                        (Cell::Fail, None, Some(unexpected_payload(&other).to_string()))
                    }
                    ProbeOutcome::Failure(failure) => (Cell::Fail, None, Some(failure.to_string())),
                };
                FindEventRow {
                    position: index + 1,
                    server: server.to_string(),
                    found,
                    depth,
                    error,
                }
            })
            .collect();
        Self {
            event_id: event_id.to_string(),
            rows,
            total_elapsed: report.elapsed,
        }
    }

    pub fn found(&self) -> usize {
        self.rows.iter().filter(|row| row.found == Cell::Ok).count()
    }
}

impl fmt::Display for FindEventReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hosts asked for {}", self.event_id)?;
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                vec![
                    row.position.to_string(),
                    row.server.clone(),
                    row.found.label().to_string(),
                    row.depth.map(|d| d.to_string()).unwrap_or_default(),
                    row.error.clone().unwrap_or_default(),
                ]
            })
            .collect();
        render_table(f, &["#", "Server", "Found", "Depth", "Error"], &rows)?;
        writeln!(f, "{} of {} hosts have the event", self.found(), self.rows.len())?;
        write_elapsed(f, self.total_elapsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRow {
    pub depth: Option<i64>,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub state_key: Option<String>,
    pub sender: Option<String>,
    pub error: Option<String>,
}

impl EventRow {
    fn from_summary(event: &EventSummary) -> Self {
        Self {
            depth: event.depth,
            event_id: event.event_id.clone(),
            event_type: Some(event.event_type.clone()),
            state_key: event.state_key.clone(),
            sender: event.sender.clone(),
            error: None,
        }
    }
}

/// Events ascending by depth; events without a depth and failed fetches
/// come last.
#[derive(Debug, Clone, Serialize)]
pub struct EventListReport {
    pub heading: String,
    pub rows: Vec<EventRow>,
    pub total_elapsed: Option<Duration>,
}

impl EventListReport {
    pub fn from_events(heading: impl Into<String>, events: &[EventSummary]) -> Self {
        let mut rows: Vec<EventRow> = events.iter().map(EventRow::from_summary).collect();
        sort_event_rows(&mut rows);
        Self {
            heading: heading.into(),
            rows,
            total_elapsed: None,
        }
    }

    /// One row per id in `event_ids`, fetched or not.
    pub fn from_dispatch(
        heading: impl Into<String>,
        event_ids: &[String],
        report: &DispatchReport<String, EventSummary>,
    ) -> Self {
        let mut rows: Vec<EventRow> = ordered_outcomes(event_ids, report)
            .into_iter()
            .map(|(event_id, outcome)| match outcome {
                ProbeOutcome::Success(event) => EventRow::from_summary(&event),
                ProbeOutcome::Failure(failure) => EventRow {
                    depth: None,
                    event_id: Some(event_id),
                    event_type: None,
                    state_key: None,
                    sender: None,
                    error: Some(failure.to_string()),
                },
            })
            .collect();
        sort_event_rows(&mut rows);
        Self {
            heading: heading.into(),
            rows,
            total_elapsed: Some(report.elapsed),
        }
    }
}

fn sort_event_rows(rows: &mut [EventRow]) {
    rows.sort_by(|a, b| {
        a.error
            .is_some()
            .cmp(&b.error.is_some())
            .then_with(|| a.depth.is_none().cmp(&b.depth.is_none()))
            .then_with(|| a.depth.cmp(&b.depth))
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
}

impl fmt::Display for EventListReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.heading)?;
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                let depth = row.depth.map(|d| d.to_string()).unwrap_or_else(|| "-".into());
                let event_id = row.event_id.clone().unwrap_or_else(|| "-".into());
                match &row.error {
                    Some(error) => vec![depth, event_id, format!("FAIL {error}")],
                    None => {
                        let mut kind = row.event_type.clone().unwrap_or_default();
                        if let Some(state_key) = row.state_key.as_deref().filter(|k| !k.is_empty()) {
                            kind = format!("{kind} ({state_key})");
                        }
                        vec![depth, event_id, kind, row.sender.clone().unwrap_or_default()]
                    }
                }
            })
            .collect();
        render_table(f, &["Depth", "Event ID", "Event Type", "Sender"], &rows)?;
        writeln!(f, "{} events", self.rows.len())?;
        match self.total_elapsed {
            Some(elapsed) => write_elapsed(f, elapsed),
            None => Ok(()),
        }
    }
}

/// One event as served by `server`.
#[derive(Debug, Clone, Serialize)]
pub struct EventReport {
    pub server: String,
    pub event: EventSummary,
}

impl fmt::Display for EventReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = &self.event;
        let or_dash = |value: Option<&str>| value.unwrap_or("-").to_string();
        writeln!(f, "Event ID:   {}", or_dash(event.event_id.as_deref()))?;
        writeln!(f, "Served by:  {}", self.server)?;
        writeln!(f, "Room ID:    {}", or_dash(event.room_id.as_deref()))?;
        writeln!(f, "Type:       {}", event.event_type)?;
        if let Some(state_key) = &event.state_key {
            writeln!(f, "State key:  {state_key}")?;
        }
        writeln!(f, "Sender:     {}", or_dash(event.sender.as_deref()))?;
        writeln!(
            f,
            "Depth:      {}",
            event.depth.map(|d| d.to_string()).unwrap_or_else(|| "-".into())
        )?;
        writeln!(
            f,
            "Sent:       {}",
            event.origin_server_ts.map(format_ts).unwrap_or_else(|| "-".into())
        )?;
        writeln!(f, "Prev events:")?;
        for id in &event.prev_events {
            writeln!(f, "  {id}")?;
        }
        writeln!(f, "Auth events:")?;
        for id in &event.auth_events {
            writeln!(f, "  {id}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    #[serde(flatten)]
    pub list: DeviceList,
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Devices of {} (stream id {})",
            self.list.user_id, self.list.stream_id
        )?;
        let rows: Vec<Vec<String>> = self
            .list
            .devices
            .iter()
            .map(|device| {
                vec![
                    device.device_id.clone(),
                    device.display_name.clone().unwrap_or_default(),
                    device.key_count.to_string(),
                    device.algorithms.join(", "),
                ]
            })
            .collect();
        render_table(f, &["Device ID", "Display name", "Keys", "Algorithms"], &rows)
    }
}
