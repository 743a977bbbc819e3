//! Identifier types shared by every Colony process

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sentinel address for the simulation environment.
pub const ENV_ADDRESS: &str = "ENV";
/// Sentinel address for a broadcast to every agent.
pub const ALL_ADDRESS: &str = "all";
/// Prefix of a type-addressed destination (`type:<agent_type>`).
pub const TYPE_ADDRESS_PREFIX: &str = "type:";

/// Error type for ID validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    /// The ID string is empty
    Empty,
    /// The ID has leading or trailing whitespace
    LeadingTrailingWhitespace,
    /// The ID contains invalid characters
    InvalidCharacters,
    /// The ID collides with a routing sentinel (`ENV`, `all`)
    Reserved,
}

impl fmt::Display for IdValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "ID cannot be empty"),
            Self::LeadingTrailingWhitespace => {
                write!(f, "ID cannot have leading or trailing whitespace")
            }
            Self::InvalidCharacters => write!(
                f,
                "ID can only contain alphanumeric characters, hyphens, underscores, and dots"
            ),
            Self::Reserved => write!(f, "ID is reserved for routing ('ENV', 'all')"),
        }
    }
}

impl std::error::Error for IdValidationError {}

fn validate_id(s: &str) -> Result<(), IdValidationError> {
    if s.is_empty() {
        return Err(IdValidationError::Empty);
    }
    if s != s.trim() {
        return Err(IdValidationError::LeadingTrailingWhitespace);
    }
    if !s
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(IdValidationError::InvalidCharacters);
    }
    if s == ENV_ADDRESS || s == ALL_ADDRESS {
        return Err(IdValidationError::Reserved);
    }
    Ok(())
}

/// Globally unique identifier of an agent.
///
/// Valid IDs are non-empty, carry no surrounding whitespace, use only
/// alphanumerics, hyphens, underscores and dots, and are not one of the
/// routing sentinels.
///
/// ```
/// use colony_core::AgentId;
///
/// assert!(AgentId::parse("trader-7").is_ok());
/// assert!(AgentId::parse("ENV").is_err());
/// assert!(AgentId::parse("a/b").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Parse and validate an agent ID
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();
        validate_id(s)?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AgentId {
    type Error = IdValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_id(&value)?;
        Ok(Self(value))
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl FromStr for AgentId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a worker process, unique among live workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();
        validate_id(s)?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WorkerId {
    type Error = IdValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_id(&value)?;
        Ok(Self(value))
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

impl FromStr for WorkerId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing address of an event endpoint.
///
/// Serialized as a plain string: an agent id, `ENV`, `all`, or
/// `type:<agent_type>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    /// A single agent
    Agent(AgentId),
    /// The simulation environment (lives on the master)
    Env,
    /// Every agent in the cluster
    All,
    /// Every agent of the given type
    Type(String),
}

impl Address {
    pub fn agent(id: &AgentId) -> Self {
        Self::Agent(id.clone())
    }

    pub fn parse(s: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = s.as_ref();
        match s {
            ENV_ADDRESS => Ok(Self::Env),
            ALL_ADDRESS => Ok(Self::All),
            _ => match s.strip_prefix(TYPE_ADDRESS_PREFIX) {
                Some(agent_type) => {
                    validate_id(agent_type)?;
                    Ok(Self::Type(agent_type.to_string()))
                }
                None => AgentId::parse(s).map(Self::Agent),
            },
        }
    }

    pub fn as_agent(&self) -> Option<&AgentId> {
        match self {
            Self::Agent(id) => Some(id),
            _ => None,
        }
    }

    /// Whether an agent with this id and type is addressed
    pub fn matches(&self, id: &AgentId, agent_type: &str) -> bool {
        match self {
            Self::Agent(target) => target == id,
            Self::All => true,
            Self::Type(t) => t == agent_type,
            Self::Env => false,
        }
    }

    /// Broadcast-style addresses fan out to more than one agent.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::All | Self::Type(_))
    }
}

impl TryFrom<String> for Address {
    type Error = IdValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl From<AgentId> for Address {
    fn from(id: AgentId) -> Self {
        Self::Agent(id)
    }
}

impl FromStr for Address {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => f.write_str(id.as_str()),
            Self::Env => f.write_str(ENV_ADDRESS),
            Self::All => f.write_str(ALL_ADDRESS),
            Self::Type(t) => write!(f, "{TYPE_ADDRESS_PREFIX}{t}"),
        }
    }
}
