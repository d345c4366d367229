//! Scenario model: impairment specifications, targets and schedules

pub mod recurrence;
pub mod schedule;
pub mod target;

use crate::scenario::schedule::{SchedulingError, parse_duration};
use crate::scenario::target::{Target, TargetResolutionError};
use crate::topology::units::{Bandwidth, Percent, TimeSpan};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Applied to transient scenarios that don't declare a duration
pub const DEFAULT_DURATION: &str = "PT15M";

pub const DEFAULT_PRIORITY: i64 = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScenarioKind {
    Persistent,
    Transient,
}

impl Display for ScenarioKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioKind::Persistent => f.write_str("persistent"),
            ScenarioKind::Transient => f.write_str("transient"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayDistribution {
    Uniform,
    Normal,
    Pareto,
    Paretonormal,
}

impl Display for DelayDistribution {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DelayDistribution::Uniform => "uniform",
            DelayDistribution::Normal => "normal",
            DelayDistribution::Pareto => "pareto",
            DelayDistribution::Paretonormal => "paretonormal",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JitterSpec {
    pub mean: Option<TimeSpan>,
    pub stddev: Option<TimeSpan>,
}

/// Packet-level impairments, in the vocabulary of `tc netem`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetemSpec {
    pub delay: Option<TimeSpan>,
    pub delay_variation: Option<TimeSpan>,
    pub delay_correlation: Option<Percent>,
    pub distribution: Option<DelayDistribution>,
    pub loss: Option<Percent>,
    pub loss_correlation: Option<Percent>,
    pub duplicate: Option<Percent>,
    pub corrupt: Option<Percent>,
    pub reorder: Option<Percent>,
    pub reorder_correlation: Option<Percent>,
    pub rate: Option<Bandwidth>,
    pub jitter: Option<JitterSpec>,
}

impl NetemSpec {
    pub fn loss(percent: Percent) -> Self {
        Self {
            loss: Some(percent),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tc_args().is_empty()
    }

    /// The arguments that follow `tc qdisc add dev <iface> root netem`
    pub fn tc_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(delay) = self.delay {
            args.extend(["delay".to_string(), delay.to_string()]);
            if let Some(variation) = self.delay_variation {
                args.push(variation.to_string());
                if let Some(correlation) = self.delay_correlation {
                    args.push(correlation.to_string());
                }
            }
            if let Some(distribution) = self.distribution {
                args.extend(["distribution".to_string(), distribution.to_string()]);
            }
        }

        if let Some(jitter) = &self.jitter {
            let zero = TimeSpan(Duration::ZERO);
            args.extend([
                "delay".to_string(),
                jitter.mean.unwrap_or(zero).to_string(),
                jitter.stddev.unwrap_or(zero).to_string(),
            ]);
        }

        if let Some(loss) = self.loss {
            args.extend(["loss".to_string(), loss.to_string()]);
            if let Some(correlation) = self.loss_correlation {
                args.push(correlation.to_string());
            }
        }

        if let Some(duplicate) = self.duplicate {
            args.extend(["duplicate".to_string(), duplicate.to_string()]);
        }

        if let Some(corrupt) = self.corrupt {
            args.extend(["corrupt".to_string(), corrupt.to_string()]);
        }

        if let Some(reorder) = self.reorder {
            args.extend(["reorder".to_string(), reorder.to_string()]);
            if let Some(correlation) = self.reorder_correlation {
                args.push(correlation.to_string());
            }
        }

        if let Some(rate) = self.rate {
            args.extend(["rate".to_string(), rate.to_string()]);
        }

        args
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QdiscKind {
    #[default]
    Htb,
    Tbf,
    Pfifo,
    FqCodel,
}

/// Queueing discipline change
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QdiscSpec {
    #[serde(rename = "type", default)]
    pub kind: QdiscKind,
    pub rate: Option<Bandwidth>,
    pub ceil: Option<Bandwidth>,
    pub burst: Option<String>,
    pub cburst: Option<String>,
    pub limit: Option<u32>,
    pub latency: Option<TimeSpan>,
}

impl QdiscSpec {
    /// The `tc` invocations that install this discipline on `dev`
    pub fn tc_commands(&self, dev: &str) -> Vec<String> {
        match self.kind {
            QdiscKind::Htb => {
                let mut commands = vec![format!("tc qdisc add dev {dev} root handle 1: htb default 10")];
                if let Some(rate) = self.rate {
                    let ceil = self.ceil.unwrap_or(rate);
                    let burst = self.burst.as_deref().unwrap_or("15k");
                    let cburst = self.cburst.as_deref().unwrap_or("15k");
                    commands.push(format!(
                        "tc class add dev {dev} parent 1: classid 1:10 htb rate {rate} ceil {ceil} burst {burst} cburst {cburst}"
                    ));
                }
                commands
            }
            QdiscKind::Tbf => {
                // Without a rate there is nothing for the token bucket to enforce
                let Some(rate) = self.rate else {
                    return Vec::new();
                };
                let burst = self.burst.as_deref().unwrap_or("32kbit");
                let latency = self
                    .latency
                    .unwrap_or(TimeSpan(Duration::from_millis(50)));
                vec![format!(
                    "tc qdisc add dev {dev} root tbf rate {rate} burst {burst} latency {latency}"
                )]
            }
            QdiscKind::Pfifo | QdiscKind::FqCodel => {
                let name = match self.kind {
                    QdiscKind::Pfifo => "pfifo",
                    _ => "fq_codel",
                };
                let mut command = format!("tc qdisc add dev {dev} root {name}");
                if let Some(limit) = self.limit {
                    command.push_str(&format!(" limit {limit}"));
                }
                vec![command]
            }
        }
    }
}

/// Composite impairment: packet-level faults and/or a queueing discipline
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImpairmentSpec {
    pub netem: Option<NetemSpec>,
    pub qdisc: Option<QdiscSpec>,
}

impl ImpairmentSpec {
    pub fn netem(netem: NetemSpec) -> Self {
        Self {
            netem: Some(netem),
            qdisc: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.netem.as_ref().is_none_or(NetemSpec::is_empty) && self.qdisc.is_none()
    }

    /// The full list of `tc` invocations needed to enforce this impairment on `dev`
    pub fn tc_commands(&self, dev: &str) -> Vec<String> {
        let mut commands = Vec::new();
        if let Some(netem) = &self.netem {
            let args = netem.tc_args();
            if !args.is_empty() {
                commands.push(format!("tc qdisc add dev {dev} root netem {}", args.join(" ")));
            }
        }
        if let Some(qdisc) = &self.qdisc {
            commands.extend(qdisc.tc_commands(dev));
        }
        commands
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScenarioSpec {
    pub id: Arc<str>,
    pub kind: ScenarioKind,
    /// Raw target, e.g. `link:h1->r1` (see [`Target`])
    pub applies_to: String,
    pub impairment: ImpairmentSpec,
    /// Cron expression or recurrence rule, required for transient scenarios
    pub schedule: Option<String>,
    /// ISO-8601 style duration (`PT15M`) or a number of seconds
    pub duration: Option<String>,
    pub priority: i64,
    pub description: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ScenarioSpec {
    pub fn persistent(
        id: impl Into<Arc<str>>,
        applies_to: impl Into<String>,
        impairment: ImpairmentSpec,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ScenarioKind::Persistent,
            applies_to: applies_to.into(),
            impairment,
            schedule: None,
            duration: None,
            priority: DEFAULT_PRIORITY,
            description: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn transient(
        id: impl Into<Arc<str>>,
        applies_to: impl Into<String>,
        impairment: ImpairmentSpec,
        schedule: Option<String>,
        duration: Option<String>,
    ) -> Self {
        Self {
            kind: ScenarioKind::Transient,
            schedule,
            duration,
            ..Self::persistent(id, applies_to, impairment)
        }
    }

    pub fn target(&self) -> Result<Target, TargetResolutionError> {
        self.applies_to.parse()
    }

    pub fn active_duration(&self) -> Result<Duration, SchedulingError> {
        parse_duration(self.duration.as_deref().unwrap_or(DEFAULT_DURATION))
    }
}

/// A scenario record that could not be read from the document
#[derive(Clone, Debug, Serialize)]
pub struct RejectedScenario {
    pub id: Option<String>,
    pub kind: ScenarioKind,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ScenarioSet {
    pub persistent: Vec<ScenarioSpec>,
    pub transient: Vec<ScenarioSpec>,
    pub rejected: Vec<RejectedScenario>,
}

impl ScenarioSet {
    pub fn iter(&self) -> impl Iterator<Item = &ScenarioSpec> {
        self.persistent.iter().chain(self.transient.iter())
    }

    pub fn len(&self) -> usize {
        self.persistent.len() + self.transient.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
