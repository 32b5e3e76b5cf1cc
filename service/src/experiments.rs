use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle states for an experiment. `Archive` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Preflight,
    Build,
    Launch,
    Run,
    Decide,
    Archive,
}

impl ExperimentStatus {
    pub const ALL: [Self; 7] = [
        Self::Draft,
        Self::Preflight,
        Self::Build,
        Self::Launch,
        Self::Run,
        Self::Decide,
        Self::Archive,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Preflight => "preflight",
            Self::Build => "build",
            Self::Launch => "launch",
            Self::Run => "run",
            Self::Decide => "decide",
            Self::Archive => "archive",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }

    /// States reachable from `self`, excluding the always-allowed
    /// same-state no-op.
    pub const fn allowed_transitions(self) -> &'static [ExperimentStatus] {
        match self {
            Self::Draft => &[Self::Preflight, Self::Archive],
            Self::Preflight => &[Self::Build, Self::Draft, Self::Archive],
            Self::Build => &[Self::Launch, Self::Preflight, Self::Archive],
            Self::Launch => &[Self::Run, Self::Archive],
            Self::Run => &[Self::Decide, Self::Archive],
            Self::Decide => &[Self::Archive],
            Self::Archive => &[],
        }
    }

    pub fn can_transition_to(self, next: ExperimentStatus) -> bool {
        self == next || self.allowed_transitions().contains(&next)
    }

    /// Public landing pages only see experiments that accept traffic.
    pub fn accepts_leads(self) -> bool {
        matches!(self, Self::Launch | Self::Run)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Waitlist,
    Presale,
    FakeDoor,
    Concierge,
    LandingPage,
    Newsletter,
    ProductizedService,
}

impl Archetype {
    pub const ALL: [Self; 7] = [
        Self::Waitlist,
        Self::Presale,
        Self::FakeDoor,
        Self::Concierge,
        Self::LandingPage,
        Self::Newsletter,
        Self::ProductizedService,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waitlist => "waitlist",
            Self::Presale => "presale",
            Self::FakeDoor => "fake_door",
            Self::Concierge => "concierge",
            Self::LandingPage => "landing_page",
            Self::Newsletter => "newsletter",
            Self::ProductizedService => "productized_service",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|archetype| archetype.as_str() == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Qualified,
    Scheduled,
    ClosedWon,
    ClosedLost,
    Disqualified,
}

impl LeadStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Qualified => "qualified",
            Self::Scheduled => "scheduled",
            Self::ClosedWon => "closed_won",
            Self::ClosedLost => "closed_lost",
            Self::Disqualified => "disqualified",
        }
    }
}

/// Threshold rules for killing an experiment early. Versioned so the
/// stored shape can evolve without a migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillCriteria {
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<KillRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRule {
    pub metric: String,
    pub op: KillRuleOp,
    pub threshold: i64,
    #[serde(default)]
    pub window_days: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillRuleOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyPack {
    pub version: u32,
    pub headline: String,
    #[serde(default)]
    pub subheadline: Option<String>,
    #[serde(default)]
    pub cta_label: Option<String>,
    #[serde(default)]
    pub bullets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreativeBrief {
    pub version: u32,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub hooks: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

const BLOB_SCHEMA_VERSION: u32 = 1;

/// Validate a structured blob at the boundary and return its canonical
/// serialized form for storage.
pub fn validate_blob<T: serde::de::DeserializeOwned + Serialize>(
    field: &'static str,
    value: &Value,
    version_of: impl Fn(&T) -> u32,
) -> Result<String, BlobError> {
    let parsed: T = serde_json::from_value(value.clone()).map_err(|source| BlobError::Shape {
        field,
        message: source.to_string(),
    })?;
    let version = version_of(&parsed);
    if version != BLOB_SCHEMA_VERSION {
        return Err(BlobError::Version { field, version });
    }
    serde_json::to_string(&parsed).map_err(|source| BlobError::Shape {
        field,
        message: source.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("{field}: {message}")]
    Shape {
        field: &'static str,
        message: String,
    },
    #[error("{field}: unsupported version {version}")]
    Version { field: &'static str, version: u32 },
}

/// Patchable experiment fields. Anything outside this allow-list is
/// silently dropped by deserialization, never errored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExperimentPatch {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub problem_statement: Option<String>,
    #[serde(default)]
    pub target_audience: Option<String>,
    #[serde(default)]
    pub value_proposition: Option<String>,
    #[serde(default)]
    pub market_size_estimate: Option<String>,
    #[serde(default)]
    pub min_signups: Option<i64>,
    #[serde(default)]
    pub max_spend_cents: Option<i64>,
    #[serde(default)]
    pub max_duration_days: Option<i64>,
    #[serde(default)]
    pub kill_criteria: Option<Value>,
    #[serde(default)]
    pub copy_pack: Option<Value>,
    #[serde(default)]
    pub creative_brief: Option<Value>,
    #[serde(default)]
    pub stripe_price_id: Option<String>,
    #[serde(default)]
    pub stripe_product_id: Option<String>,
    #[serde(default)]
    pub price_cents: Option<i64>,
}

impl ExperimentPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.name.is_none()
            && self.slug.is_none()
            && self.problem_statement.is_none()
            && self.target_audience.is_none()
            && self.value_proposition.is_none()
            && self.market_size_estimate.is_none()
            && self.min_signups.is_none()
            && self.max_spend_cents.is_none()
            && self.max_duration_days.is_none()
            && self.kill_criteria.is_none()
            && self.copy_pack.is_none()
            && self.creative_brief.is_none()
            && self.stripe_price_id.is_none()
            && self.stripe_product_id.is_none()
            && self.price_cents.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRecord {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub status: ExperimentStatus,
    pub archetype: Archetype,
    pub problem_statement: Option<String>,
    pub target_audience: Option<String>,
    pub value_proposition: Option<String>,
    pub market_size_estimate: Option<String>,
    pub min_signups: Option<i64>,
    pub max_spend_cents: Option<i64>,
    pub max_duration_days: Option<i64>,
    pub kill_criteria: Option<Value>,
    pub copy_pack: Option<Value>,
    pub creative_brief: Option<Value>,
    pub stripe_price_id: Option<String>,
    pub stripe_product_id: Option<String>,
    pub price_cents: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub launched_at: Option<i64>,
    pub decided_at: Option<i64>,
}

impl ExperimentRecord {
    /// Subset of fields safe to expose on the public slug endpoint.
    /// Internal thresholds and kill criteria never leave the admin API.
    pub fn public_payload(&self) -> Value {
        let mut payload = serde_json::json!({
            "id": self.id,
            "name": self.name,
            "slug": self.slug,
            "status": self.status,
            "archetype": self.archetype,
            "copy_pack": self.copy_pack,
            "created_at": self.created_at,
        });
        if let Some(price_cents) = self.price_cents {
            payload["price_cents"] = Value::from(price_cents);
        }
        if let Some(stripe_price_id) = &self.stripe_price_id {
            payload["stripe_price_id"] = Value::from(stripe_price_id.clone());
        }
        payload
    }
}

/// Experiment ids look like `SC-2026-001`: a year scope plus a
/// three-digit sequence.
pub fn format_experiment_id(year: i32, sequence: u32) -> String {
    format!("SC-{year}-{sequence:03}")
}
