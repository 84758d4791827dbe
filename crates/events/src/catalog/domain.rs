//! Identity and access events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use brushwork_core::{TenantId, UserId};

use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCreated {
    pub tenant_id: TenantId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event for TenantCreated {
    const NAME: &'static str = "TenantCreated";
    const VERSION: u16 = 1;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub username: String,
    pub email: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event for UserRegistered {
    const NAME: &'static str = "UserRegistered";
    const VERSION: u16 = 1;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGranted {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub role: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event for RoleGranted {
    const NAME: &'static str = "RoleGranted";
    const VERSION: u16 = 1;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// A claim (type/value pair) attached to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimAssigned {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub claim_type: String,
    pub claim_value: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event for ClaimAssigned {
    const NAME: &'static str = "ClaimAssigned";
    const VERSION: u16 = 1;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
