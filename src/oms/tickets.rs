//! Hedge tickets: the work items that carry a perp fill until its spot
//! hedge completes, with the secondary indices that route fills back.

use std::collections::HashMap;

use crate::types::Side;

/// Residual below this is treated as fully hedged.
pub const QTY_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Open,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct HedgeTicket {
    pub ticket_id: String,
    pub symbol: String,
    /// Hedge direction: the opposite of the perp fill that opened it.
    pub side: Side,
    pub want_qty: f64,
    pub filled_qty: f64,
    pub created_ts: f64,
    pub deadline_ts: f64,
    pub tries: u32,
    pub status: TicketStatus,
    pub reason: String,
}

impl HedgeTicket {
    pub fn remain(&self) -> f64 {
        (self.want_qty - self.filled_qty).max(0.0)
    }

    pub fn is_filled(&self) -> bool {
        self.remain() <= QTY_EPS
    }
}

/// Owning table of tickets plus the client_oid/order_id routing indices.
/// All indices are cleared together on ticket removal so no dangling
/// references survive a terminal transition.
#[derive(Debug, Default)]
pub struct TicketBook {
    tickets: HashMap<String, HedgeTicket>,
    by_client_oid: HashMap<String, String>,
    by_order_id: HashMap<String, String>,
    /// Spot fills arrive without a client_oid; this recovers it.
    order_to_client: HashMap<String, String>,
}

impl TicketBook {
    pub fn insert(&mut self, ticket: HedgeTicket) {
        // The first hedge attempt reuses the ticket id as client_oid.
        self.by_client_oid
            .insert(ticket.ticket_id.clone(), ticket.ticket_id.clone());
        self.tickets.insert(ticket.ticket_id.clone(), ticket);
    }

    pub fn get(&self, ticket_id: &str) -> Option<&HedgeTicket> {
        self.tickets.get(ticket_id)
    }

    pub fn get_mut(&mut self, ticket_id: &str) -> Option<&mut HedgeTicket> {
        self.tickets.get_mut(ticket_id)
    }

    pub fn link_client_oid(&mut self, client_oid: &str, ticket_id: &str) {
        self.by_client_oid
            .insert(client_oid.to_string(), ticket_id.to_string());
    }

    pub fn link_order(&mut self, order_id: &str, client_oid: &str, ticket_id: &str) {
        if order_id.is_empty() {
            return;
        }
        self.by_order_id
            .insert(order_id.to_string(), ticket_id.to_string());
        self.order_to_client
            .insert(order_id.to_string(), client_oid.to_string());
    }

    /// Restore a missing client_oid from the order_id index.
    pub fn client_oid_for_order(&self, order_id: &str) -> Option<&String> {
        self.order_to_client.get(order_id)
    }

    /// Resolve a fill to its ticket: order_id first, then client_oid.
    pub fn resolve(&self, order_id: &str, client_oid: &str) -> Option<String> {
        if !order_id.is_empty() {
            if let Some(ticket_id) = self.by_order_id.get(order_id) {
                return Some(ticket_id.clone());
            }
        }
        if !client_oid.is_empty() {
            if let Some(ticket_id) = self.by_client_oid.get(client_oid) {
                return Some(ticket_id.clone());
            }
        }
        None
    }

    /// Remove a ticket and every index entry pointing at it.
    pub fn remove(&mut self, ticket_id: &str) -> Option<HedgeTicket> {
        let ticket = self.tickets.remove(ticket_id)?;
        self.by_client_oid.retain(|_, tid| tid != ticket_id);
        let dead_orders: Vec<String> = self
            .by_order_id
            .iter()
            .filter(|(_, tid)| tid.as_str() == ticket_id)
            .map(|(order_id, _)| order_id.clone())
            .collect();
        for order_id in dead_orders {
            self.by_order_id.remove(&order_id);
            self.order_to_client.remove(&order_id);
        }
        Some(ticket)
    }

    pub fn open_ids(&self) -> Vec<String> {
        self.tickets
            .iter()
            .filter(|(_, ticket)| ticket.status == TicketStatus::Open)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.tickets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}
