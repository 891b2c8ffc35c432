//! Append-only record of named resolution and probe steps.

use std::fmt;

use serde::Serialize;

/// Every step a delegation diagnosis can report, in the order they run.
/// A resolution trace always contains each of [`StepId::RESOLUTION`] exactly
/// once so traces from different servers line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepId {
    ServerName,
    LiteralIp,
    DnsWithPort,
    WellKnown,
    DelegatedLiteralIp,
    DelegatedDnsWithPort,
    DelegatedSrvModern,
    DelegatedSrvDeprecated,
    DelegatedDefaultPort,
    SrvModern,
    SrvDeprecated,
    DefaultPort,
    Connectivity,
}

impl StepId {
    pub const RESOLUTION: [StepId; 12] = [
        StepId::ServerName,
        StepId::LiteralIp,
        StepId::DnsWithPort,
        StepId::WellKnown,
        StepId::DelegatedLiteralIp,
        StepId::DelegatedDnsWithPort,
        StepId::DelegatedSrvModern,
        StepId::DelegatedSrvDeprecated,
        StepId::DelegatedDefaultPort,
        StepId::SrvModern,
        StepId::SrvDeprecated,
        StepId::DefaultPort,
    ];

    pub fn label(self) -> &'static str {
        match self {
            StepId::ServerName => "server-name",
            StepId::LiteralIp => "1. literal-ip",
            StepId::DnsWithPort => "2. dns-with-port",
            StepId::WellKnown => "3. well-known",
            StepId::DelegatedLiteralIp => "3a. delegated literal-ip",
            StepId::DelegatedDnsWithPort => "3b. delegated dns-with-port",
            StepId::DelegatedSrvModern => "3c. delegated srv _matrix-fed._tcp",
            StepId::DelegatedSrvDeprecated => "3d. delegated srv _matrix._tcp",
            StepId::DelegatedDefaultPort => "3e. delegated host:8448",
            StepId::SrvModern => "4. srv _matrix-fed._tcp",
            StepId::SrvDeprecated => "5. srv _matrix._tcp",
            StepId::DefaultPort => "6. host:8448",
            StepId::Connectivity => "connectivity",
        }
    }

    pub fn is_srv(self) -> bool {
        matches!(
            self,
            StepId::DelegatedSrvModern
                | StepId::DelegatedSrvDeprecated
                | StepId::SrvModern
                | StepId::SrvDeprecated
        )
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOutcome {
    Ok,
    Failed,
    Skipped,
    NotAttempted,
}

impl StepOutcome {
    pub fn label(self) -> &'static str {
        match self {
            StepOutcome::Ok => "ok",
            StepOutcome::Failed => "failed",
            StepOutcome::Skipped => "skipped",
            StepOutcome::NotAttempted => "not-attempted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticStep {
    pub id: StepId,
    pub outcome: StepOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticTrace {
    steps: Vec<DiagnosticStep>,
}

impl DiagnosticTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: StepId, outcome: StepOutcome, detail: impl Into<String>) {
        self.steps.push(DiagnosticStep {
            id,
            outcome,
            detail: detail.into(),
        });
    }

    pub fn steps(&self) -> &[DiagnosticStep] {
        &self.steps
    }

    pub fn get(&self, id: StepId) -> Option<&DiagnosticStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn outcome(&self, id: StepId) -> Option<StepOutcome> {
        self.get(id).map(|step| step.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &DiagnosticStep> {
        self.steps
            .iter()
            .filter(|step| step.outcome == StepOutcome::Failed)
    }

    pub fn ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|step| step.id).collect()
    }
}

impl fmt::Display for DiagnosticTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            write!(f, "{:<36} {:<13}", step.id.label(), step.outcome.label())?;
            if !step.detail.is_empty() {
                write!(f, " {}", step.detail)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order_and_looks_up_by_id() {
        let mut trace = DiagnosticTrace::new();
        trace.record(StepId::ServerName, StepOutcome::Ok, "example.org");
        trace.record(StepId::LiteralIp, StepOutcome::NotAttempted, "");
        trace.record(StepId::WellKnown, StepOutcome::Failed, "404 Not Found");

        assert_eq!(
            trace.ids(),
            vec![StepId::ServerName, StepId::LiteralIp, StepId::WellKnown]
        );
        assert_eq!(trace.outcome(StepId::WellKnown), Some(StepOutcome::Failed));
        assert_eq!(trace.outcome(StepId::SrvModern), None);
        assert_eq!(trace.failures().count(), 1);
    }

    #[test]
    fn renders_one_line_per_step() {
        let mut trace = DiagnosticTrace::new();
        trace.record(StepId::ServerName, StepOutcome::Ok, "example.org");
        trace.record(StepId::DefaultPort, StepOutcome::Skipped, "");
        let rendered = trace.to_string();
        assert_eq!(rendered.lines().count(), 2);
        assert!(rendered.contains("6. host:8448"));
        assert!(rendered.contains("skipped"));
    }
}
