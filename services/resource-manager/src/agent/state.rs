//! Per-agent resource ledger.
//!
//! `AgentState` is plain data: the connection layer owns the live copy and
//! the schedulers work on clones. Methods never talk to the network or the
//! store; anything that must be published is returned to the caller.

use std::collections::{BTreeMap, HashMap, HashSet};

use berth_events::{Container, ContainerState, ContainerStateChanged, Device, DeviceId, ReleaseResources};
use berth_id::{AgentId, AllocationId, ContainerId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AgentError, AgentResult};

// =============================================================================
// Slots
// =============================================================================

/// The flags that together decide whether a slot is schedulable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotEnabled {
    /// Whether the device is currently part of the device view.
    pub device_added: bool,
    pub agent_enabled: bool,
    pub user_enabled: bool,
    pub draining: bool,
}

impl SlotEnabled {
    pub fn enabled(&self) -> bool {
        self.agent_enabled && self.user_enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub device: Device,
    pub enabled: SlotEnabled,
    pub container_id: Option<ContainerId>,
}

/// Operator view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSummary {
    pub id: String,
    pub device: Device,
    pub enabled: bool,
    pub draining: bool,
    pub container: Option<Container>,
}

/// A partial update of a slot's user flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotPatch {
    pub enabled: Option<bool>,
    pub drain: Option<bool>,
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotData {
    pub device: Device,
    pub user_enabled: bool,
    pub container_id: Option<ContainerId>,
}

/// Persisted form of an agent, used to resume after a manager restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub uuid: String,
    pub resource_pool: String,
    pub user_enabled: bool,
    pub user_draining: bool,
    pub max_zero_slot_containers: usize,
    pub slots: Vec<SlotData>,
    pub containers: Vec<ContainerId>,
}

// =============================================================================
// Agent State
// =============================================================================

/// Scheduling state of one agent.
///
/// Cloning yields an independent copy; schedulers mutate clones to try out
/// placements and preemptions without touching the live ledger.
#[derive(Debug, Clone)]
pub struct AgentState {
    id: AgentId,
    resource_pool: String,
    /// Schedulable devices and the container occupying each.
    devices: BTreeMap<Device, Option<ContainerId>>,
    enabled: bool,
    draining: bool,
    uuid: Uuid,
    max_zero_slot_containers: usize,
    slot_states: BTreeMap<DeviceId, Slot>,
    container_allocation: HashMap<ContainerId, AllocationId>,
    /// Owners of containers reserved but not yet started.
    reservations: HashMap<ContainerId, AllocationId>,
    container_state: HashMap<ContainerId, Container>,
}

impl AgentState {
    pub fn new(id: AgentId, resource_pool: impl Into<String>, max_zero_slot_containers: usize) -> Self {
        Self {
            id,
            resource_pool: resource_pool.into(),
            devices: BTreeMap::new(),
            enabled: true,
            draining: false,
            uuid: Uuid::new_v4(),
            max_zero_slot_containers,
            slot_states: BTreeMap::new(),
            container_allocation: HashMap::new(),
            reservations: HashMap::new(),
            container_state: HashMap::new(),
        }
    }

    /// A started agent exposing the given devices, all enabled.
    pub fn with_devices(
        id: AgentId,
        resource_pool: impl Into<String>,
        max_zero_slot_containers: usize,
        devices: &[Device],
    ) -> Self {
        let mut state = Self::new(id, resource_pool, max_zero_slot_containers);
        state.agent_started(devices);
        state
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn resource_pool(&self) -> &str {
        &self.resource_pool
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn max_zero_slot_containers(&self) -> usize {
        self.max_zero_slot_containers
    }

    pub fn set_max_zero_slot_containers(&mut self, max: usize) {
        self.max_zero_slot_containers = max;
    }

    pub fn devices(&self) -> &BTreeMap<Device, Option<ContainerId>> {
        &self.devices
    }

    pub fn container_allocation(&self) -> &HashMap<ContainerId, AllocationId> {
        &self.container_allocation
    }

    pub fn container_state(&self) -> &HashMap<ContainerId, Container> {
        &self.container_state
    }

    pub fn allocation_of(&self, container_id: &ContainerId) -> Option<&AllocationId> {
        self.container_allocation.get(container_id)
    }

    /// Forgets the allocation a container belonged to.
    pub fn remove_container_allocation(&mut self, container_id: &ContainerId) -> Option<AllocationId> {
        self.container_allocation.remove(container_id)
    }

    // -------------------------------------------------------------------------
    // Capacity
    // -------------------------------------------------------------------------

    /// Total slots. A draining agent only reports what it still runs.
    pub fn num_slots(&self) -> usize {
        if self.draining {
            self.num_used_slots()
        } else if !self.enabled {
            0
        } else {
            self.devices.len()
        }
    }

    pub fn num_empty_slots(&self) -> usize {
        if self.draining || !self.enabled {
            0
        } else {
            self.num_slots().saturating_sub(self.num_used_slots())
        }
    }

    pub fn num_used_slots(&self) -> usize {
        self.devices.values().filter(|c| c.is_some()).count()
    }

    /// Containers holding no devices.
    pub fn num_used_zero_slots(&self) -> usize {
        self.container_state
            .values()
            .filter(|c| c.devices.is_empty())
            .count()
    }

    pub fn num_zero_slots(&self) -> usize {
        if self.draining {
            self.num_used_zero_slots()
        } else if !self.enabled {
            0
        } else {
            self.max_zero_slot_containers
        }
    }

    pub fn num_empty_zero_slots(&self) -> usize {
        if self.draining || !self.enabled {
            0
        } else {
            self.num_zero_slots().saturating_sub(self.num_used_zero_slots())
        }
    }

    /// Every slot the agent reported, whatever its flags.
    pub fn num_total_slots(&self) -> usize {
        self.slot_states.len()
    }

    pub fn idle(&self) -> bool {
        self.num_used_zero_slots() == 0 && self.num_used_slots() == 0
    }

    // -------------------------------------------------------------------------
    // Reservations
    // -------------------------------------------------------------------------

    /// Reserves `slots` free devices for a new container.
    ///
    /// A zero-slot request reserves auxiliary capacity only and returns no
    /// devices. On failure nothing stays reserved.
    pub fn allocate_free_devices(&mut self, slots: usize, container_id: ContainerId) -> AgentResult<Vec<Device>> {
        self.container_state
            .insert(container_id.clone(), Container::assigned(container_id.clone()));
        if slots == 0 {
            return Ok(Vec::new());
        }

        let free: Vec<Device> = self
            .devices
            .iter()
            .filter(|(_, occupant)| occupant.is_none())
            .map(|(device, _)| device.clone())
            .take(slots)
            .collect();

        if free.len() != slots {
            self.container_state.remove(&container_id);
            return Err(AgentError::NotEnoughDevices {
                needed: slots,
                available: free.len(),
            });
        }

        for device in &free {
            self.devices.insert(device.clone(), Some(container_id.clone()));
        }
        if let Some(container) = self.container_state.get_mut(&container_id) {
            container.devices = free.clone();
        }

        Ok(free)
    }

    /// Reserves devices on behalf of an allocation, remembering the owner
    /// until the container is started or deallocated.
    pub fn reserve_devices(
        &mut self,
        allocation_id: AllocationId,
        slots: usize,
        container_id: ContainerId,
    ) -> AgentResult<Vec<Device>> {
        let devices = self.allocate_free_devices(slots, container_id.clone())?;
        self.reservations.insert(container_id, allocation_id);
        Ok(devices)
    }

    /// Returns a container's devices and auxiliary capacity to the agent.
    pub fn deallocate_container(&mut self, container_id: &ContainerId) {
        self.reservations.remove(container_id);
        self.container_state.remove(container_id);
        for occupant in self.devices.values_mut() {
            if occupant.as_ref() == Some(container_id) {
                *occupant = None;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Enable / disable
    // -------------------------------------------------------------------------

    pub fn enable(&mut self) {
        info!(agent_id = %self.id, "enabling agent");
        self.enabled = true;
        self.draining = false;
    }

    pub fn disable(&mut self, drain: bool) {
        if drain {
            info!(agent_id = %self.id, "draining agent");
        } else {
            info!(agent_id = %self.id, "disabling agent");
        }
        self.draining = drain;
        self.enabled = false;
    }

    // -------------------------------------------------------------------------
    // Agent protocol
    // -------------------------------------------------------------------------

    /// Initializes one slot per reported device, all enabled.
    pub fn agent_started(&mut self, devices: &[Device]) {
        for device in devices {
            let slot = Slot {
                device: device.clone(),
                enabled: SlotEnabled {
                    agent_enabled: true,
                    user_enabled: true,
                    ..SlotEnabled::default()
                },
                container_id: None,
            };
            self.slot_states.insert(device.id, slot);
            // A fresh slot has no container, so there is nothing to release.
            let _ = self.update_slot_device_view(device.id);
        }
    }

    /// Rejects an `AgentStarted` whose devices differ from the known slots.
    pub fn check_agent_started_devices_match(&self, devices: &[Device]) -> AgentResult<()> {
        let ours: BTreeMap<DeviceId, &Device> =
            self.slot_states.iter().map(|(id, slot)| (*id, &slot.device)).collect();
        let theirs: BTreeMap<DeviceId, &Device> = devices.iter().map(|d| (d.id, d)).collect();

        if ours.len() != theirs.len() {
            return Err(AgentError::DeviceCountChanged {
                before: ours.len(),
                after: theirs.len(),
            });
        }

        for (id, before) in &ours {
            match theirs.get(id) {
                Some(after) if after == before => {}
                Some(after) => {
                    return Err(AgentError::DevicePropertiesChanged {
                        before: before.to_string(),
                        after: after.to_string(),
                    })
                }
                None => {
                    return Err(AgentError::DevicePropertiesChanged {
                        before: before.to_string(),
                        after: "missing".to_string(),
                    })
                }
            }
        }

        Ok(())
    }

    /// Records a container transition reported by the agent.
    pub fn container_state_changed(&mut self, sc: &ContainerStateChanged) {
        let terminated = sc.container.state == ContainerState::Terminated;
        for device in &sc.container.devices {
            let Some(slot) = self.slot_states.get_mut(&device.id) else {
                warn!(agent_id = %self.id, device_id = device.id, "bad container state change on unknown device");
                continue;
            };
            slot.container_id = if terminated {
                None
            } else {
                Some(sc.container.id.clone())
            };
        }

        if terminated {
            self.container_state.remove(&sc.container.id);
        } else {
            self.container_state
                .insert(sc.container.id.clone(), sc.container.clone());
        }
    }

    /// Binds a container to its slots ahead of sending `StartContainer`.
    pub fn start_container(&mut self, allocation_id: AllocationId, container: &Container) -> AgentResult<()> {
        if self.is_container_bound(&container.id) {
            return Err(AgentError::ContainerAlreadyStarted(container.id.clone()));
        }
        for device in &container.devices {
            let reason = match self.slot_states.get(&device.id) {
                None => Some("can't find slot"),
                Some(slot) if !slot.enabled.enabled() => {
                    Some("container allocated but slot is not enabled")
                }
                Some(slot) if slot.container_id.is_some() => {
                    Some("container already allocated to slot")
                }
                Some(_) => None,
            };
            if let Some(reason) = reason {
                return Err(AgentError::StartContainer {
                    device: device.id,
                    agent: self.id.clone(),
                    reason,
                });
            }
        }

        for device in &container.devices {
            if let Some(slot) = self.slot_states.get_mut(&device.id) {
                slot.container_id = Some(container.id.clone());
            }
        }
        self.container_state
            .insert(container.id.clone(), container.clone());
        self.reservations.remove(&container.id);
        self.container_allocation
            .insert(container.id.clone(), allocation_id);
        Ok(())
    }

    /// Whether a start for this container was already applied.
    pub fn is_container_bound(&self, container_id: &ContainerId) -> bool {
        self.container_allocation.contains_key(container_id)
            || self
                .slot_states
                .values()
                .any(|slot| slot.container_id.as_ref() == Some(container_id))
    }

    // -------------------------------------------------------------------------
    // Slot flags
    // -------------------------------------------------------------------------

    /// Reconciles the device view with a slot's flags.
    ///
    /// Returns a forced release when a non-draining slot is disabled while a
    /// container still holds it.
    pub fn update_slot_device_view(&mut self, device_id: DeviceId) -> Option<ReleaseResources> {
        let Some(slot) = self.slot_states.get_mut(&device_id) else {
            warn!(agent_id = %self.id, device_id, "bad slot device view update: not found");
            return None;
        };

        if slot.enabled.enabled() && !slot.enabled.device_added {
            slot.enabled.device_added = true;
            info!(agent_id = %self.id, device = %slot.device, "adding device");
            self.devices
                .insert(slot.device.clone(), slot.container_id.clone());
            return None;
        }

        if slot.enabled.enabled() || slot.enabled.draining {
            return None;
        }

        let reserved = self.devices.get(&slot.device).cloned().flatten();
        if slot.enabled.device_added {
            slot.enabled.device_added = false;
            info!(agent_id = %self.id, device = %slot.device, "removing device");
            self.devices.remove(&slot.device);
        }

        let container_id = slot.container_id.clone().or(reserved)?;
        let Some(allocation_id) = self
            .container_allocation
            .get(&container_id)
            .or_else(|| self.reservations.get(&container_id))
        else {
            warn!(
                agent_id = %self.id,
                device_id,
                container_id = %container_id,
                "disabled slot held a container with no known allocation"
            );
            return None;
        };
        Some(ReleaseResources {
            allocation_id: allocation_id.clone(),
            reason: "slot disabled".to_string(),
            force_kill: true,
        })
    }

    /// Applies a patch to one slot.
    pub fn patch_slot_state(
        &mut self,
        device_id: DeviceId,
        patch: SlotPatch,
    ) -> AgentResult<(SlotSummary, Option<ReleaseResources>)> {
        if !self.slot_states.contains_key(&device_id) {
            return Err(AgentError::SlotNotFound(device_id));
        }
        let release = self.patch_slot_inner(device_id, patch);
        let summary = self
            .slot_summary(device_id)
            .ok_or(AgentError::SlotNotFound(device_id))?;
        Ok((summary, release))
    }

    /// Pushes the agent-wide enabled and draining flags down to every slot.
    pub fn patch_all_slots_state(&mut self) -> Vec<ReleaseResources> {
        let enabled = self.enabled;
        let draining = self.draining;
        let ids: Vec<DeviceId> = self.slot_states.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| {
                self.patch_slot_inner(
                    id,
                    SlotPatch {
                        enabled: Some(enabled),
                        drain: Some(draining),
                    },
                )
            })
            .collect()
    }

    fn patch_slot_inner(&mut self, device_id: DeviceId, patch: SlotPatch) -> Option<ReleaseResources> {
        let slot = self.slot_states.get_mut(&device_id)?;
        if let Some(enabled) = patch.enabled {
            slot.enabled.user_enabled = enabled;
        }
        if let Some(drain) = patch.drain {
            slot.enabled.draining = drain;
        }
        self.update_slot_device_view(device_id)
    }

    pub fn slot_summary(&self, device_id: DeviceId) -> Option<SlotSummary> {
        let slot = self.slot_states.get(&device_id)?;
        let container = slot
            .container_id
            .as_ref()
            .and_then(|id| self.container_state.get(id))
            .cloned();
        Some(SlotSummary {
            id: slot.device.id.to_string(),
            device: slot.device.clone(),
            enabled: slot.enabled.enabled(),
            draining: slot.enabled.draining,
            container,
        })
    }

    pub fn slots_summary(&self) -> Vec<SlotSummary> {
        self.slot_states
            .keys()
            .filter_map(|id| self.slot_summary(*id))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> AgentSnapshot {
        let mut containers: Vec<ContainerId> = self.container_state.keys().cloned().collect();
        containers.sort();
        AgentSnapshot {
            agent_id: self.id.clone(),
            uuid: self.uuid.to_string(),
            resource_pool: self.resource_pool.clone(),
            user_enabled: self.enabled,
            user_draining: self.draining,
            max_zero_slot_containers: self.max_zero_slot_containers,
            slots: self
                .slot_states
                .values()
                .map(|slot| SlotData {
                    device: slot.device.clone(),
                    user_enabled: slot.enabled.user_enabled,
                    container_id: slot.container_id.clone(),
                })
                .collect(),
            containers,
        }
    }

    /// Rebuilds an agent from its snapshot and the persisted container rows.
    ///
    /// The container to allocation mapping is left empty; see
    /// [`AgentState::restore_containers_field`].
    pub fn from_snapshot(snapshot: &AgentSnapshot, containers: Vec<Container>) -> AgentResult<Self> {
        let uuid = Uuid::parse_str(&snapshot.uuid)
            .map_err(|e| AgentError::InvalidSnapshot(format!("{}: {e}", snapshot.agent_id)))?;

        let mut slot_states = BTreeMap::new();
        let mut devices = BTreeMap::new();
        for data in &snapshot.slots {
            slot_states.insert(
                data.device.id,
                Slot {
                    device: data.device.clone(),
                    container_id: data.container_id.clone(),
                    enabled: SlotEnabled {
                        device_added: true,
                        agent_enabled: snapshot.user_enabled,
                        user_enabled: snapshot.user_enabled,
                        draining: snapshot.user_draining,
                    },
                },
            );
            devices.insert(data.device.clone(), data.container_id.clone());
        }

        Ok(Self {
            id: snapshot.agent_id.clone(),
            resource_pool: snapshot.resource_pool.clone(),
            devices,
            enabled: snapshot.user_enabled,
            draining: snapshot.user_draining,
            uuid,
            max_zero_slot_containers: snapshot.max_zero_slot_containers,
            slot_states,
            container_allocation: HashMap::new(),
            reservations: HashMap::new(),
            container_state: containers.into_iter().map(|c| (c.id.clone(), c)).collect(),
        })
    }

    /// Merges persisted container to allocation pairs into the mapping.
    pub fn restore_containers_field(&mut self, allocations: HashMap<ContainerId, AllocationId>) {
        debug!(agent_id = %self.id, restored = allocations.len(), "restored containers");
        self.container_allocation.extend(allocations);
    }

    /// Container IDs known to this agent, sorted.
    pub fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = self.container_state.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drops every container not confirmed recovered. Returns whether
    /// anything changed.
    pub fn clear_unless_recovered(&mut self, recovered: &HashSet<ContainerId>) -> bool {
        let mut updated = false;

        for (device, occupant) in self.devices.iter_mut() {
            if let Some(cid) = occupant {
                if !recovered.contains(cid) {
                    *occupant = None;
                    if let Some(slot) = self.slot_states.get_mut(&device.id) {
                        slot.container_id = None;
                    }
                    updated = true;
                }
            }
        }

        for slot in self.slot_states.values_mut() {
            if let Some(cid) = &slot.container_id {
                if !recovered.contains(cid) {
                    slot.container_id = None;
                    updated = true;
                }
            }
        }

        let before = self.container_state.len() + self.container_allocation.len();
        self.container_state.retain(|cid, _| recovered.contains(cid));
        self.container_allocation.retain(|cid, _| recovered.contains(cid));
        self.reservations.retain(|cid, _| recovered.contains(cid));
        if self.container_state.len() + self.container_allocation.len() != before {
            updated = true;
        }

        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_events::{ContainerStopped, DeviceType};

    fn gpus(n: u32) -> Vec<Device> {
        (0..n)
            .map(|i| Device::new(i, DeviceType::Cuda, format!("GPU-{i}")))
            .collect()
    }

    fn agent(slots: u32) -> AgentState {
        AgentState::with_devices(AgentId::from("agent1"), "default", 100, &gpus(slots))
    }

    #[test]
    fn test_capacity_counters() {
        let mut state = agent(4);
        assert_eq!(state.num_slots(), 4);
        assert_eq!(state.num_empty_slots(), 4);
        assert_eq!(state.num_zero_slots(), 100);
        assert!(state.idle());

        state.allocate_free_devices(3, ContainerId::from("c1")).unwrap();
        state.allocate_free_devices(0, ContainerId::from("c2")).unwrap();
        assert_eq!(state.num_used_slots(), 3);
        assert_eq!(state.num_empty_slots(), 1);
        assert_eq!(state.num_used_slots() + state.num_empty_slots(), state.num_slots());
        assert_eq!(state.num_used_zero_slots(), 1);
        assert_eq!(state.num_empty_zero_slots(), 99);
        assert!(!state.idle());
    }

    #[test]
    fn test_draining_reports_used_capacity_only() {
        let mut state = agent(4);
        state.allocate_free_devices(1, ContainerId::from("c1")).unwrap();
        state.allocate_free_devices(0, ContainerId::from("c2")).unwrap();

        state.disable(true);
        assert_eq!(state.num_slots(), 1);
        assert_eq!(state.num_empty_slots(), 0);
        assert_eq!(state.num_zero_slots(), 1);
        assert_eq!(state.num_empty_zero_slots(), 0);

        state.disable(false);
        assert_eq!(state.num_slots(), 0);
        assert_eq!(state.num_zero_slots(), 0);

        state.enable();
        assert_eq!(state.num_slots(), 4);
    }

    #[test]
    fn test_allocate_not_enough_devices_leaves_nothing_behind() {
        let mut state = agent(2);
        let err = state
            .allocate_free_devices(3, ContainerId::from("c1"))
            .unwrap_err();
        assert!(matches!(err, AgentError::NotEnoughDevices { needed: 3, available: 2 }));
        assert!(state.container_state().is_empty());
        assert_eq!(state.num_used_slots(), 0);
    }

    #[test]
    fn test_deallocate_frees_devices() {
        let mut state = agent(2);
        let cid = ContainerId::from("c1");
        let devices = state.allocate_free_devices(2, cid.clone()).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, 0);

        state.deallocate_container(&cid);
        assert_eq!(state.num_used_slots(), 0);
        assert!(state.idle());
    }

    #[test]
    fn test_clone_is_independent() {
        let state = agent(2);
        let mut copy = state.clone();
        copy.allocate_free_devices(2, ContainerId::from("c1")).unwrap();
        assert_eq!(state.num_used_slots(), 0);
        assert_eq!(copy.num_used_slots(), 2);
    }

    #[test]
    fn test_devices_match_check() {
        let state = agent(2);
        assert!(state.check_agent_started_devices_match(&gpus(2)).is_ok());

        let err = state.check_agent_started_devices_match(&gpus(3)).unwrap_err();
        assert_eq!(err.to_string(), "device count has changed: 2 -> 3");

        let mut changed = gpus(2);
        changed[1].uuid = "GPU-other".to_string();
        let err = state.check_agent_started_devices_match(&changed).unwrap_err();
        assert!(matches!(err, AgentError::DevicePropertiesChanged { .. }));
    }

    #[test]
    fn test_start_container_binds_slots() {
        let mut state = agent(2);
        let cid = ContainerId::from("c1");
        let devices = state.allocate_free_devices(1, cid.clone()).unwrap();
        let container = Container {
            id: cid.clone(),
            state: ContainerState::Assigned,
            devices,
        };

        state
            .start_container(AllocationId::from("alloc1"), &container)
            .unwrap();
        assert_eq!(state.allocation_of(&cid).unwrap().as_str(), "alloc1");
        let summary = state.slot_summary(0).unwrap();
        assert_eq!(summary.container.unwrap().id, cid);

        let err = state
            .start_container(AllocationId::from("alloc2"), &container)
            .unwrap_err();
        assert!(matches!(err, AgentError::ContainerAlreadyStarted(id) if id == cid));

        let other = Container {
            id: ContainerId::from("c2"),
            ..container
        };
        let err = state
            .start_container(AllocationId::from("alloc2"), &other)
            .unwrap_err();
        assert!(err.to_string().contains("container already allocated to slot"));
    }

    #[test]
    fn test_start_container_on_disabled_slot() {
        let mut state = agent(1);
        state
            .patch_slot_state(0, SlotPatch { enabled: Some(false), drain: None })
            .unwrap();
        let container = Container {
            id: ContainerId::from("c1"),
            state: ContainerState::Assigned,
            devices: gpus(1),
        };
        let err = state
            .start_container(AllocationId::from("alloc1"), &container)
            .unwrap_err();
        assert!(err.to_string().contains("slot is not enabled"));
    }

    #[test]
    fn test_failed_start_leaves_no_partial_binding() {
        let mut state = agent(2);
        state
            .patch_slot_state(1, SlotPatch { enabled: Some(false), drain: None })
            .unwrap();
        let container = Container {
            id: ContainerId::from("c9"),
            state: ContainerState::Assigned,
            devices: gpus(2),
        };

        let err = state
            .start_container(AllocationId::from("alloc1"), &container)
            .unwrap_err();
        assert!(matches!(err, AgentError::StartContainer { device: 1, .. }));

        assert!(!state.container_state().contains_key(&container.id));
        assert!(state.allocation_of(&container.id).is_none());
        assert!(state.slot_summary(0).unwrap().container.is_none());
        assert!(!state.is_container_bound(&container.id));
    }

    #[test]
    fn test_disabling_slot_releases_reserved_container() {
        let mut state = agent(2);
        let cid = ContainerId::from("c1");
        let devices = state
            .reserve_devices(AllocationId::from("alloc1"), 1, cid.clone())
            .unwrap();

        let (_, release) = state
            .patch_slot_state(devices[0].id, SlotPatch { enabled: Some(false), drain: None })
            .unwrap();
        let release = release.unwrap();
        assert_eq!(release.allocation_id, AllocationId::from("alloc1"));
        assert!(release.force_kill);
    }

    #[test]
    fn test_started_container_forgets_reservation() {
        let mut state = agent(1);
        let cid = ContainerId::from("c1");
        let devices = state
            .reserve_devices(AllocationId::from("alloc1"), 1, cid.clone())
            .unwrap();
        state
            .start_container(
                AllocationId::from("alloc1"),
                &Container {
                    id: cid.clone(),
                    state: ContainerState::Assigned,
                    devices,
                },
            )
            .unwrap();
        assert!(state.reservations.is_empty());
        assert_eq!(state.allocation_of(&cid), Some(&AllocationId::from("alloc1")));
    }

    #[test]
    fn test_container_terminated_clears_slot() {
        let mut state = agent(1);
        let cid = ContainerId::from("c1");
        let devices = state.allocate_free_devices(1, cid.clone()).unwrap();
        let mut container = Container {
            id: cid.clone(),
            state: ContainerState::Running,
            devices,
        };
        state
            .start_container(AllocationId::from("alloc1"), &container)
            .unwrap();

        container.state = ContainerState::Terminated;
        state.container_state_changed(&ContainerStateChanged::terminated(
            container,
            ContainerStopped::default(),
        ));
        assert!(state.container_state().is_empty());
        assert!(state.slot_summary(0).unwrap().container.is_none());
    }

    #[test]
    fn test_disabling_occupied_slot_forces_release() {
        let mut state = agent(2);
        let cid = ContainerId::from("c1");
        let devices = state.allocate_free_devices(1, cid.clone()).unwrap();
        let container = Container {
            id: cid,
            state: ContainerState::Running,
            devices,
        };
        state
            .start_container(AllocationId::from("alloc1"), &container)
            .unwrap();

        let (summary, release) = state
            .patch_slot_state(0, SlotPatch { enabled: Some(false), drain: None })
            .unwrap();
        assert!(!summary.enabled);
        let release = release.unwrap();
        assert_eq!(release.reason, "slot disabled");
        assert!(release.force_kill);
        assert_eq!(state.devices().len(), 1);

        let (_, release) = state
            .patch_slot_state(1, SlotPatch { enabled: Some(false), drain: None })
            .unwrap();
        assert!(release.is_none());
    }

    #[test]
    fn test_draining_slot_keeps_device_and_container() {
        let mut state = agent(1);
        let cid = ContainerId::from("c1");
        let devices = state.allocate_free_devices(1, cid.clone()).unwrap();
        state
            .start_container(
                AllocationId::from("alloc1"),
                &Container { id: cid, state: ContainerState::Running, devices },
            )
            .unwrap();

        state.disable(true);
        let releases = state.patch_all_slots_state();
        assert!(releases.is_empty());
        assert_eq!(state.devices().len(), 1);
        assert!(state.slot_summary(0).unwrap().draining);
    }

    #[test]
    fn test_patch_unknown_slot() {
        let mut state = agent(1);
        let err = state.patch_slot_state(7, SlotPatch::default()).unwrap_err();
        assert!(matches!(err, AgentError::SlotNotFound(7)));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut state = agent(2);
        let cid = ContainerId::from("c1");
        let devices = state.allocate_free_devices(1, cid.clone()).unwrap();
        let container = Container {
            id: cid.clone(),
            state: ContainerState::Running,
            devices,
        };
        state
            .start_container(AllocationId::from("alloc1"), &container)
            .unwrap();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.containers, vec![cid.clone()]);

        let mut restored = AgentState::from_snapshot(&snapshot, vec![container]).unwrap();
        assert_eq!(restored.uuid(), state.uuid());
        assert_eq!(restored.num_used_slots(), 1);
        assert!(restored.container_allocation().is_empty());

        restored.restore_containers_field(HashMap::from([(cid.clone(), AllocationId::from("alloc1"))]));
        assert_eq!(restored.allocation_of(&cid).unwrap().as_str(), "alloc1");
    }

    #[test]
    fn test_snapshot_with_bad_uuid() {
        let mut snapshot = agent(1).snapshot();
        snapshot.uuid = "not-a-uuid".to_string();
        assert!(matches!(
            AgentState::from_snapshot(&snapshot, vec![]),
            Err(AgentError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_clear_unless_recovered() {
        let mut state = agent(2);
        for (i, name) in ["c1", "c2"].iter().enumerate() {
            let cid = ContainerId::from(*name);
            let devices = state.allocate_free_devices(1, cid.clone()).unwrap();
            state
                .start_container(
                    AllocationId::from(format!("alloc{i}").as_str()),
                    &Container { id: cid, state: ContainerState::Running, devices },
                )
                .unwrap();
        }

        let recovered = HashSet::from([ContainerId::from("c2")]);
        assert!(state.clear_unless_recovered(&recovered));
        assert_eq!(state.num_used_slots(), 1);
        assert_eq!(state.container_allocation().len(), 1);
        assert!(state.allocation_of(&ContainerId::from("c2")).is_some());

        assert!(!state.clear_unless_recovered(&recovered));
    }
}
