//! Bill of lading lifecycle: statuses, roles and the transition table.
//!
//! The lifecycle is a fixed linear pipeline:
//!
//! `pending -> approved -> assigned -> accepted -> picked_up -> en_route -> delivered -> unpaid -> paid`
//!
//! Every status has at most one forward edge and `paid` has none. Which roles
//! may move a record *into* a status is data, loaded once through
//! [`TransitionTable::standard`] and checked for completeness before use.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::error::ValidationError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum BolStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Assigned,
    #[n(3)]
    Accepted,
    #[n(4)]
    PickedUp,
    #[n(5)]
    EnRoute,
    #[n(6)]
    Delivered,
    #[n(7)]
    Unpaid,
    #[n(8)]
    Paid,
}

impl BolStatus {
    pub const ALL: [BolStatus; 9] = [
        BolStatus::Pending,
        BolStatus::Approved,
        BolStatus::Assigned,
        BolStatus::Accepted,
        BolStatus::PickedUp,
        BolStatus::EnRoute,
        BolStatus::Delivered,
        BolStatus::Unpaid,
        BolStatus::Paid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BolStatus::Pending => "pending",
            BolStatus::Approved => "approved",
            BolStatus::Assigned => "assigned",
            BolStatus::Accepted => "accepted",
            BolStatus::PickedUp => "picked_up",
            BolStatus::EnRoute => "en_route",
            BolStatus::Delivered => "delivered",
            BolStatus::Unpaid => "unpaid",
            BolStatus::Paid => "paid",
        }
    }

    /// Position in the pipeline, `pending` is 0.
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// Statuses at or after `approved` live on the ledger.
    pub fn is_on_ledger(&self) -> bool {
        *self >= BolStatus::Approved
    }

    pub fn is_terminal(&self) -> bool {
        *self == BolStatus::Paid
    }
}

impl fmt::Display for BolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BolStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BolStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownStatus(s.to_string()))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum Role {
    #[n(0)]
    Shipper,
    #[n(1)]
    Consignee,
    #[n(2)]
    Carrier,
    #[n(3)]
    Broker,
    /// Bypasses the role check. Never bypasses the transition check.
    #[n(4)]
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Shipper => "shipper",
            Role::Consignee => "consignee",
            Role::Carrier => "carrier",
            Role::Broker => "broker",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shipper" => Ok(Role::Shipper),
            "consignee" => Ok(Role::Consignee),
            "carrier" => Ok(Role::Carrier),
            "broker" => Ok(Role::Broker),
            "admin" => Ok(Role::Admin),
            other => Err(ValidationError::UnknownRole(other.to_string())),
        }
    }
}

/// Why a transition was or was not allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    Terminal { current: BolStatus },
    NotAdjacent { current: BolStatus, requested: BolStatus },
    MissingRole { requested: BolStatus, required: Vec<Role> },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::Terminal { current } => {
                write!(f, "{current} is terminal and has no further transitions")
            }
            DenialReason::NotAdjacent { current, requested } => {
                write!(f, "cannot move from {current} to {requested}")
            }
            DenialReason::MissingRole { requested, required } => {
                let roles: Vec<&str> = required.iter().map(Role::as_str).collect();
                write!(f, "moving to {requested} requires one of [{}]", roles.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<DenialReason>,
}

impl Decision {
    fn allow() -> Self {
        Self { allowed: true, reason: None }
    }
    fn deny(reason: DenialReason) -> Self {
        Self { allowed: false, reason: Some(reason) }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionTable {
    next: BTreeMap<BolStatus, BolStatus>,
    roles: BTreeMap<BolStatus, BTreeSet<Role>>,
}

impl TransitionTable {
    /// The production table. Validated before it is returned.
    pub fn standard() -> Self {
        use BolStatus::*;
        use Role::*;

        let next = BTreeMap::from([
            (Pending, Approved),
            (Approved, Assigned),
            (Assigned, Accepted),
            (Accepted, PickedUp),
            (PickedUp, EnRoute),
            (EnRoute, Delivered),
            (Delivered, Unpaid),
            (Unpaid, Paid),
        ]);

        // roles allowed to move a record *into* the status; `pending` covers creation
        let roles = BTreeMap::from([
            (Pending, BTreeSet::from([Shipper, Broker])),
            (Approved, BTreeSet::from([Shipper, Broker])),
            (Assigned, BTreeSet::from([Shipper, Broker])),
            (Accepted, BTreeSet::from([Carrier])),
            (PickedUp, BTreeSet::from([Carrier])),
            (EnRoute, BTreeSet::from([Carrier])),
            (Delivered, BTreeSet::from([Carrier, Consignee])),
            (Unpaid, BTreeSet::from([Carrier, Broker])),
            (Paid, BTreeSet::from([Shipper, Consignee, Broker])),
        ]);

        let table = Self { next, roles };
        // the literal above is covered by `standard_table_is_complete`
        debug_assert!(table.validate().is_ok());
        table
    }

    /// Build a table from raw data, refusing incomplete or non-linear input.
    pub fn from_parts(
        next: BTreeMap<BolStatus, BolStatus>,
        roles: BTreeMap<BolStatus, BTreeSet<Role>>,
    ) -> Result<Self, ValidationError> {
        let table = Self { next, roles };
        table.validate()?;
        Ok(table)
    }

    /// Startup check: every status has a non-empty role set and every edge
    /// moves exactly one step forward.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for status in BolStatus::ALL {
            match self.roles.get(&status) {
                Some(roles) if !roles.is_empty() => {}
                _ => return Err(ValidationError::IncompleteRoleTable(status)),
            }
        }
        for (from, to) in &self.next {
            if to.ordinal() != from.ordinal() + 1 {
                return Err(ValidationError::NonLinearEdge { from: *from, to: *to });
            }
        }
        if self.next.contains_key(&BolStatus::Paid) {
            return Err(ValidationError::NonLinearEdge {
                from: BolStatus::Paid,
                to: self.next[&BolStatus::Paid],
            });
        }
        Ok(())
    }

    pub fn next_status(&self, current: BolStatus) -> Option<BolStatus> {
        self.next.get(&current).copied()
    }

    pub fn can_transition(&self, current: BolStatus, requested: BolStatus) -> Decision {
        match self.next_status(current) {
            None => Decision::deny(DenialReason::Terminal { current }),
            Some(next) if next == requested => Decision::allow(),
            Some(_) => Decision::deny(DenialReason::NotAdjacent { current, requested }),
        }
    }

    pub fn required_roles(&self, requested: BolStatus) -> BTreeSet<Role> {
        self.roles.get(&requested).cloned().unwrap_or_default()
    }

    pub fn has_authority(&self, roles: &BTreeSet<Role>, requested: BolStatus) -> bool {
        if roles.contains(&Role::Admin) {
            return true;
        }
        self.roles
            .get(&requested)
            .is_some_and(|required| !required.is_disjoint(roles))
    }

    /// Both checks together. The transition check runs first so that an
    /// admin asking for an illegal move is told why.
    pub fn authorize(
        &self,
        roles: &BTreeSet<Role>,
        current: BolStatus,
        requested: BolStatus,
    ) -> Decision {
        let legal = self.can_transition(current, requested);
        if !legal.allowed {
            return legal;
        }
        if !self.has_authority(roles, requested) {
            return Decision::deny(DenialReason::MissingRole {
                requested,
                required: self.required_roles(requested).into_iter().collect(),
            });
        }
        Decision::allow()
    }

    /// Next statuses this role set may request from `current`.
    pub fn valid_next(&self, current: BolStatus, roles: &BTreeSet<Role>) -> Vec<BolStatus> {
        self.next_status(current)
            .filter(|next| self.has_authority(roles, *next))
            .into_iter()
            .collect()
    }

    /// Every status strictly between `from` and `to`, ending with `to`.
    pub fn path(&self, from: BolStatus, to: BolStatus) -> Vec<BolStatus> {
        let mut path = Vec::new();
        let mut cursor = from;
        while cursor != to {
            match self.next_status(cursor) {
                Some(next) => {
                    path.push(next);
                    cursor = next;
                }
                None => return Vec::new(),
            }
        }
        path
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}
