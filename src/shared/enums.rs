//! Database enum types for the helpdesk schema.
//!
//! Enums are stored as SMALLINT columns and mapped by hand so that an
//! unknown discriminant surfaces as a deserialize error instead of a
//! silently accepted string.

use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::SmallInt;
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::str::FromStr;

/// Lifecycle states of a ticket. `Open` is the sole initial state;
/// `Closed` is left only through an explicit reopen back to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum TicketStatus {
    Open = 0,
    InProgress = 1,
    Waiting = 2,
    Resolved = 3,
    Closed = 4,
}

impl Default for TicketStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl ToSql<SmallInt, Pg> for TicketStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for TicketStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::Open),
            1 => Ok(Self::InProgress),
            2 => Ok(Self::Waiting),
            3 => Ok(Self::Resolved),
            4 => Ok(Self::Closed),
            _ => Err(format!("Unknown TicketStatus: {}", value).into()),
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Waiting => write!(f, "waiting"),
            Self::Resolved => write!(f, "resolved"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "waiting" => Ok(Self::Waiting),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Unknown ticket status: {}", s)),
        }
    }
}

/// Ticket priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum TicketPriority {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl Default for TicketPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl ToSql<SmallInt, Pg> for TicketPriority {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for TicketPriority {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Medium),
            2 => Ok(Self::High),
            _ => Err(format!("Unknown TicketPriority: {}", value).into()),
        }
    }
}

impl std::fmt::Display for TicketPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for TicketPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Unknown ticket priority: {}", s)),
        }
    }
}

/// Role of the actor performing a request. Authentication is handled
/// upstream; handlers only see the resolved role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum ActorRole {
    Admin = 0,
    Employee = 1,
    Client = 2,
}

impl ActorRole {
    /// Admins and employees; the roles allowed to drive ticket status.
    pub fn is_staff(self) -> bool {
        matches!(self, Self::Admin | Self::Employee)
    }
}

impl Default for ActorRole {
    fn default() -> Self {
        Self::Client
    }
}

impl ToSql<SmallInt, Pg> for ActorRole {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let v = *self as i16;
        out.write_all(&v.to_be_bytes())?;
        Ok(serialize::IsNull::No)
    }
}

impl FromSql<SmallInt, Pg> for ActorRole {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = i16::from_sql(bytes)?;
        match value {
            0 => Ok(Self::Admin),
            1 => Ok(Self::Employee),
            2 => Ok(Self::Client),
            _ => Err(format!("Unknown ActorRole: {}", value).into()),
        }
    }
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Employee => write!(f, "employee"),
            Self::Client => write!(f, "client"),
        }
    }
}

impl FromStr for ActorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "employee" => Ok(Self::Employee),
            "client" => Ok(Self::Client),
            _ => Err(format!("Unknown actor role: {}", s)),
        }
    }
}
