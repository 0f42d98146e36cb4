//! Actor identity and ownership checks.
//!
//! Authentication itself happens outside this core: the session layer hands
//! every request an already-authenticated [`Actor`]. The core trusts that
//! identity and only enforces ownership: a shop may only mutate its own
//! packages, a driver may only advance packages currently assigned to them,
//! an admin may do anything.

use crate::error::{CoreError, CoreResult};

/// The authenticated identity attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Platform operator with full access.
    Admin,
    /// A shop account, carrying its shop id.
    Shop(String),
    /// A driver account, carrying its driver id.
    Driver(String),
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin)
    }

    /// The shop id if this actor is a shop.
    pub fn shop_id(&self) -> Option<&str> {
        match self {
            Actor::Shop(id) => Some(id),
            _ => None,
        }
    }

    /// The driver id if this actor is a driver.
    pub fn driver_id(&self) -> Option<&str> {
        match self {
            Actor::Driver(id) => Some(id),
            _ => None,
        }
    }
}

/// Shop-scope check: admin, or the shop that owns the resource.
pub fn ensure_shop_scope(actor: &Actor, owner_shop_id: &str) -> CoreResult<()> {
    match actor {
        Actor::Admin => Ok(()),
        Actor::Shop(id) if id == owner_shop_id => Ok(()),
        _ => Err(CoreError::OwnershipViolation),
    }
}

/// Driver-scope check: admin, or the driver currently assigned.
pub fn ensure_assigned_driver(actor: &Actor, assigned_driver_id: Option<&str>) -> CoreResult<()> {
    match actor {
        Actor::Admin => Ok(()),
        Actor::Driver(id) if assigned_driver_id == Some(id.as_str()) => Ok(()),
        _ => Err(CoreError::OwnershipViolation),
    }
}

/// Admin-only check.
pub fn ensure_admin(actor: &Actor) -> CoreResult<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(CoreError::OwnershipViolation)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shop_scope() {
        assert!(ensure_shop_scope(&Actor::Admin, "shop-1").is_ok());
        assert!(ensure_shop_scope(&Actor::Shop("shop-1".into()), "shop-1").is_ok());
        assert!(ensure_shop_scope(&Actor::Shop("shop-2".into()), "shop-1").is_err());
        assert!(ensure_shop_scope(&Actor::Driver("drv-1".into()), "shop-1").is_err());
    }

    #[test]
    fn test_assigned_driver_scope() {
        assert!(ensure_assigned_driver(&Actor::Admin, None).is_ok());
        assert!(ensure_assigned_driver(&Actor::Driver("drv-1".into()), Some("drv-1")).is_ok());
        assert!(ensure_assigned_driver(&Actor::Driver("drv-1".into()), Some("drv-2")).is_err());
        assert!(ensure_assigned_driver(&Actor::Driver("drv-1".into()), None).is_err());
        assert!(ensure_assigned_driver(&Actor::Shop("shop-1".into()), Some("drv-1")).is_err());
    }

    #[test]
    fn test_admin_only() {
        assert!(ensure_admin(&Actor::Admin).is_ok());
        let err = ensure_admin(&Actor::Shop("shop-1".into())).unwrap_err();
        assert_eq!(err.kind(), "OwnershipViolation");
    }
}
