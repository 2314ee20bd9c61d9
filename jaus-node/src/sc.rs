//! Service-connection state: keys, inform subscriber sets, command
//! commander sets with authority-based lead election.

use jaus_wire::address::AddressSet;
use jaus_wire::Address;
use std::collections::BTreeMap;

/// Identity of a service connection: the provider, the carried message
/// code, and the requested presence vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScKey {
    pub provider: Address,
    pub message_code: u16,
    pub presence_vector: u32,
}

/// An inform (multi-subscriber) service connection.
///
/// A subscriber lives in exactly one of `active`, `suspended`, `pending`
/// at any moment.
#[derive(Debug, Clone, Default)]
pub struct InformSc {
    pub instance_id: u8,
    /// Confirmed periodic rate, hundredths of a hertz.
    pub rate: u16,
    pub active: AddressSet,
    pub suspended: AddressSet,
    pub pending: AddressSet,
}

impl InformSc {
    pub fn add_pending(&mut self, subscriber: Address) {
        self.active.remove(&subscriber);
        self.suspended.remove(&subscriber);
        self.pending.insert(subscriber);
    }

    pub fn activate(&mut self, subscriber: Address) {
        self.suspended.remove(&subscriber);
        self.pending.remove(&subscriber);
        self.active.insert(subscriber);
    }

    pub fn suspend(&mut self, subscriber: Address) {
        self.active.remove(&subscriber);
        self.pending.remove(&subscriber);
        self.suspended.insert(subscriber);
    }

    pub fn remove(&mut self, subscriber: Address) {
        self.active.remove(&subscriber);
        self.suspended.remove(&subscriber);
        self.pending.remove(&subscriber);
    }

    pub fn is_subscriber(&self, id: Address) -> bool {
        self.active.contains(&id) || self.suspended.contains(&id)
    }

    pub fn is_pending(&self, id: Address) -> bool {
        self.pending.contains(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.active.len() + self.suspended.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.suspended.is_empty() && self.pending.is_empty()
    }

    /// The SC as a whole is suspended when nobody is active but someone
    /// still holds a (suspended or pending) interest.
    pub fn is_service_suspended(&self) -> bool {
        self.active.is_empty() && !(self.suspended.is_empty() && self.pending.is_empty())
    }
}

/// A commander and its authority code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commander {
    pub id: Address,
    pub authority: u8,
}

/// A command (authority-arbitrated) service connection. Only the lead
/// commander's messages reach the provider.
#[derive(Debug, Clone, Default)]
pub struct CommandSc {
    pub instance_id: u8,
    pub rate: u16,
    pub provider_authority: u8,
    pub active: BTreeMap<Address, u8>,
    pub suspended: BTreeMap<Address, u8>,
    pub pending: BTreeMap<Address, u8>,
    pub lead: Option<Commander>,
}

impl CommandSc {
    pub fn add_pending(&mut self, commander: Commander) {
        self.active.remove(&commander.id);
        self.suspended.remove(&commander.id);
        self.pending.insert(commander.id, commander.authority);
    }

    pub fn activate(&mut self, id: Address) {
        let authority = self
            .pending
            .remove(&id)
            .or_else(|| self.suspended.remove(&id))
            .or_else(|| self.active.get(&id).copied());
        if let Some(authority) = authority {
            self.active.insert(id, authority);
        }
    }

    pub fn suspend(&mut self, id: Address) {
        if let Some(authority) = self.active.remove(&id) {
            self.suspended.insert(id, authority);
        }
    }

    pub fn remove(&mut self, id: Address) {
        self.active.remove(&id);
        self.suspended.remove(&id);
        self.pending.remove(&id);
    }

    pub fn is_commander(&self, id: Address) -> bool {
        self.active.contains_key(&id) || self.suspended.contains_key(&id)
    }

    pub fn is_pending(&self, id: Address) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn commander_count(&self) -> usize {
        self.active.len() + self.suspended.len() + self.pending.len()
    }

    /// The rightful lead: the highest-authority active commander. Ties go
    /// to the lower address for determinism.
    pub fn elect_lead(&self) -> Option<Commander> {
        self.active
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, authority)| Commander { id: *id, authority: *authority })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inform_subscriber_moves_between_disjoint_sets() {
        let mut sc = InformSc::default();
        let s1 = Address::new(1, 1, 5, 1);

        sc.add_pending(s1);
        assert!(sc.is_pending(s1));
        assert!(!sc.is_subscriber(s1));

        sc.activate(s1);
        assert!(!sc.is_pending(s1));
        assert!(sc.is_subscriber(s1));
        assert!(!sc.is_service_suspended());

        sc.suspend(s1);
        assert!(sc.is_subscriber(s1));
        assert!(sc.is_service_suspended());

        sc.remove(s1);
        assert!(sc.is_empty());
    }

    #[test]
    fn lead_election_prefers_highest_authority() {
        let mut sc = CommandSc::default();
        let c1 = Commander { id: Address::new(1, 1, 5, 1), authority: 3 };
        let c2 = Commander { id: Address::new(1, 1, 6, 1), authority: 5 };
        let c3 = Commander { id: Address::new(1, 1, 7, 1), authority: 4 };
        for commander in [c1, c2, c3] {
            sc.add_pending(commander);
            sc.activate(commander.id);
        }

        assert_eq!(sc.elect_lead(), Some(c2));
        sc.remove(c2.id);
        assert_eq!(sc.elect_lead(), Some(c3));
        sc.suspend(c3.id);
        assert_eq!(sc.elect_lead(), Some(c1));
    }
}
