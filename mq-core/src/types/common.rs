//! Shared identifiers and small enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tenant (mall) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier, unique within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random user id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Server-assigned receipt identifier.
    ReceiptId
);
uuid_id!(
    /// Mission identifier.
    MissionId
);
uuid_id!(
    /// Tenant event identifier.
    EventId
);
uuid_id!(
    /// Session identifier.
    SessionId
);
uuid_id!(
    /// Notification identifier.
    NotificationId
);
uuid_id!(
    /// Empire facility identifier.
    FacilityId
);
uuid_id!(
    /// Companion identifier.
    CompanionId
);

/// User role within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Player,
    Admin,
    Shopkeeper,
    CustomerService,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::Admin => "admin",
            Role::Shopkeeper => "shopkeeper",
            Role::CustomerService => "customer_service",
            Role::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "player" => Some(Role::Player),
            "admin" => Some(Role::Admin),
            "shopkeeper" => Some(Role::Shopkeeper),
            "customer_service" => Some(Role::CustomerService),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    /// Service roles may submit receipts on behalf of players (POS push).
    pub fn is_service(&self) -> bool {
        matches!(self, Role::Shopkeeper | Role::System)
    }
}

/// VIP tier, a step function of VIP points.
///
/// Ordering follows tier rank so that upgrades compare with `>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VipTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl VipTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            VipTier::Bronze => "Bronze",
            VipTier::Silver => "Silver",
            VipTier::Gold => "Gold",
            VipTier::Platinum => "Platinum",
            VipTier::Diamond => "Diamond",
        }
    }
}

impl fmt::Display for VipTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_display() {
        let id = TenantId::new("deerfields");
        assert_eq!(id.to_string(), "deerfields");
        assert_eq!(id.as_str(), "deerfields");
    }

    #[test]
    fn test_uuid_ids_unique() {
        assert_ne!(ReceiptId::generate(), ReceiptId::generate());
    }

    #[test]
    fn test_receipt_id_parse_roundtrip() {
        let id = ReceiptId::generate();
        assert_eq!(ReceiptId::parse(&id.to_string()), Some(id));
        assert!(ReceiptId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::from_str("player"), Some(Role::Player));
        assert_eq!(Role::from_str("customer_service"), Some(Role::CustomerService));
        assert_eq!(Role::from_str("wizard"), None);
        assert!(Role::System.is_service());
        assert!(!Role::Player.is_service());
    }

    #[test]
    fn test_vip_tier_ordering() {
        assert!(VipTier::Diamond > VipTier::Gold);
        assert!(VipTier::Silver > VipTier::Bronze);
    }
}
