//! In-memory registry of devices connected to one relay instance.
//!
//! Owns every [`Device`] and the relay-side record of outstanding
//! `file-request`s. Callers hold it behind a mutex and never await while
//! holding the guard; outbound messages go through unbounded channels so
//! sending never blocks.

use super::identity::NetworkIdentity;
use crate::core::config::{DEVICE_ID_LEN, MAX_NICKNAME_LEN};
use crate::core::error::ConnectivityError;
use crate::core::protocol::{DeviceInfo, ServerMessage};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Visibility phase of a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Connected, not yet named. Invisible to other devices.
    Joined,
    /// Named via `set-nickname`. Visible to same-identity devices.
    Announced,
}

#[derive(Debug)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub identity: NetworkIdentity,
    pub presence: Presence,
    handle: mpsc::UnboundedSender<ServerMessage>,
}

impl Device {
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            connected: true,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Best-effort delivery. Returns `false` if the connection is gone.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.handle.send(msg).is_ok()
    }
}

#[derive(Debug)]
pub struct Registry {
    devices: HashMap<String, Device>,
    /// (requester, target) pairs awaiting `file-accept` / `file-reject`.
    pending: HashSet<(String, String)>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            devices: HashMap::new(),
            pending: HashSet::new(),
            capacity,
        }
    }

    /// Register a new silent device and return its id.
    pub fn join(
        &mut self,
        identity: NetworkIdentity,
        handle: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<String, ConnectivityError> {
        if self.devices.len() >= self.capacity {
            return Err(ConnectivityError::AtCapacity(self.capacity));
        }
        let id = self.fresh_id();
        let device = Device {
            id: id.clone(),
            name: default_name(&id),
            identity,
            presence: Presence::Joined,
            handle,
        };
        self.devices.insert(id.clone(), device);
        Ok(id)
    }

    fn fresh_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id: String = (0..DEVICE_ID_LEN)
                .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
                .collect();
            if !self.devices.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Other open, announced devices sharing `id`'s identity.
    pub fn announced_peers(&self, id: &str) -> Vec<&Device> {
        let Some(me) = self.devices.get(id) else {
            return Vec::new();
        };
        self.devices
            .values()
            .filter(|d| {
                d.id != me.id
                    && d.identity == me.identity
                    && d.presence == Presence::Announced
                    && d.is_open()
            })
            .collect()
    }

    /// Other open devices sharing `id`'s identity, announced or not.
    pub fn same_network(&self, id: &str) -> Vec<&Device> {
        let Some(me) = self.devices.get(id) else {
            return Vec::new();
        };
        self.devices
            .values()
            .filter(|d| d.id != me.id && d.identity == me.identity && d.is_open())
            .collect()
    }

    /// The target, if it exists, is open, and shares the source's identity.
    pub fn reachable(&self, source: &str, target: &str) -> Option<&Device> {
        let source = self.devices.get(source)?;
        let target = self.devices.get(target)?;
        (target.id != source.id && target.is_open() && target.identity == source.identity)
            .then_some(target)
    }

    /// Name the device and move it to [`Presence::Announced`].
    /// Returns the stored (trimmed, capped) name, or `None` if the nickname
    /// is empty or the device is unknown.
    pub fn announce(&mut self, id: &str, nickname: &str) -> Option<String> {
        let name = normalize_nickname(nickname)?;
        let device = self.devices.get_mut(id)?;
        device.name = name.clone();
        device.presence = Presence::Announced;
        Some(name)
    }

    pub fn record_pending(&mut self, requester: &str, target: &str) {
        self.pending.insert((requester.to_string(), target.to_string()));
    }

    /// Consume the pending request from `requester` to `target`, if any.
    pub fn take_pending(&mut self, requester: &str, target: &str) -> bool {
        self.pending
            .remove(&(requester.to_string(), target.to_string()))
    }

    /// Remove a device and every pending request it takes part in.
    pub fn remove(&mut self, id: &str) -> Option<Device> {
        let device = self.devices.remove(id)?;
        self.pending.retain(|(from, to)| from != id && to != id);
        Some(device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn announced_len(&self) -> usize {
        self.devices
            .values()
            .filter(|d| d.presence == Presence::Announced)
            .count()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn default_name(id: &str) -> String {
    format!("Device {}", id.to_uppercase())
}

fn normalize_nickname(nickname: &str) -> Option<String> {
    let trimmed = nickname.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_NICKNAME_LEN).collect())
}
