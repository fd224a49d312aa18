//! In-memory Compute Engine.
//!
//! Mutating calls return a `RUNNING` operation and apply their effect
//! immediately; [`ComputeApi::wait_operation`] then reports it `DONE`. Faults
//! can be injected per method (and optionally per resource name) to produce
//! HTTP errors, embedded operation errors or wait timeouts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use gantry::gce::{
    ComputeApi, Deprecation, Disk, Firewall, Image, Instance, MachineType, Metadata, Network,
    Operation, OperationError, OperationErrorDetail, OperationStatus, Subnetwork, Tags,
    last_segment, region_of,
};
use gantry::{Error, Result};

use crate::{PROJECT, ZONE};

const API: &str = "https://www.googleapis.com/compute/v1/projects";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// The call itself fails with this HTTP status
    Http { status: u16, message: String },
    /// The call succeeds but its operation finishes with this error
    Operation { code: String, message: String },
    /// Waiting on the call's operation runs out of time
    Timeout,
}

/// A failure to inject into calls of `method`.
#[derive(Debug, Clone)]
pub struct Fault {
    pub method: &'static str,
    /// Only calls whose resource name contains this
    pub target: Option<String>,
    pub kind: FaultKind,
    /// How many calls fail; `None` for all of them
    pub times: Option<usize>,
}

impl Fault {
    pub fn http(method: &'static str, status: u16, message: &str) -> Self {
        Self {
            method,
            target: None,
            kind: FaultKind::Http {
                status,
                message: message.to_string(),
            },
            times: None,
        }
    }

    pub fn operation(method: &'static str, code: &str, message: &str) -> Self {
        Self {
            method,
            target: None,
            kind: FaultKind::Operation {
                code: code.to_string(),
                message: message.to_string(),
            },
            times: None,
        }
    }

    pub fn timeout(method: &'static str) -> Self {
        Self {
            method,
            target: None,
            kind: FaultKind::Timeout,
            times: None,
        }
    }

    pub fn on(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.times = Some(n);
        self
    }
}

#[derive(Default)]
struct State {
    images: HashMap<(String, String), Image>,
    families: HashMap<(String, String), String>,
    machine_types: HashSet<String>,
    networks: HashMap<String, Network>,
    subnetworks: HashMap<(String, String), Subnetwork>,
    firewalls: BTreeMap<String, Firewall>,
    instances: BTreeMap<String, Instance>,
    disks: BTreeMap<String, Disk>,
    operations: HashMap<String, (Operation, bool)>,
    faults: Vec<Fault>,
    calls: Vec<String>,
    next_ip: u32,
    next_op: u64,
    next_fingerprint: u64,
    no_external_ip: bool,
}

impl State {
    /// Record the call and return the fault it triggers, if any.
    fn enter(&mut self, method: &'static str, target: &str) -> Option<FaultKind> {
        self.calls.push(format!("{method} {target}"));

        let idx = self.faults.iter().position(|f| {
            f.method == method
                && f.target.as_deref().is_none_or(|t| target.contains(t))
                && f.times != Some(0)
        })?;

        let fault = &mut self.faults[idx];
        if let Some(n) = fault.times.as_mut() {
            *n -= 1;
        }
        Some(fault.kind.clone())
    }

    fn fingerprint(&mut self) -> String {
        self.next_fingerprint += 1;
        format!("fp-{}", self.next_fingerprint)
    }

    fn operation(
        &mut self,
        target: &str,
        zonal: bool,
        fault: Option<FaultKind>,
    ) -> Result<Operation> {
        let timeout = match &fault {
            Some(FaultKind::Http { status, message }) => {
                return Err(Error::Api {
                    status: *status,
                    message: message.clone(),
                });
            }
            Some(FaultKind::Timeout) => true,
            _ => false,
        };

        self.next_op += 1;
        let mut op = Operation {
            name: format!("operation-{}", self.next_op),
            status: OperationStatus::Running,
            zone: zonal.then(|| format!("{API}/{PROJECT}/zones/{ZONE}")),
            target_link: Some(target.to_string()),
            error: None,
        };

        if let Some(FaultKind::Operation { code, message }) = fault {
            op.error = Some(OperationError {
                errors: vec![OperationErrorDetail { code, message }],
            });
        }

        self.operations.insert(op.name.clone(), (op.clone(), timeout));
        op.error = None;
        Ok(op)
    }
}

fn not_found(what: &str) -> Error {
    Error::Api {
        status: 404,
        message: format!("The resource '{what}' was not found"),
    }
}

fn already_exists(what: &str) -> Error {
    Error::Api {
        status: 409,
        message: format!("The resource '{what}' already exists"),
    }
}

/// Does an operation carrying a fault leave the resource untouched?
fn blocks_effect(fault: &Option<FaultKind>) -> bool {
    matches!(
        fault,
        Some(FaultKind::Http { .. }) | Some(FaultKind::Operation { .. })
    )
}

/// An in-memory Compute Engine seeded for project [`PROJECT`] in zone [`ZONE`].
pub struct FakeCompute {
    state: Mutex<State>,
}

impl Default for FakeCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCompute {
    /// Seeded with the `default` network, common machine types, a `debian-12`
    /// family (in both [`PROJECT`] and `debian-cloud`) and a Windows family.
    pub fn new() -> Self {
        let fake = Self {
            state: Mutex::new(State::default()),
        };

        for mt in ["e2-standard-4", "e2-micro", "n2-standard-2"] {
            fake.add_machine_type(mt);
        }

        let region = region_of(ZONE);
        fake.add_network(
            "default",
            &[format!("{API}/{PROJECT}/regions/{region}/subnetworks/default")],
        );
        fake.add_subnetwork(region, "default", "default");

        fake.add_image(PROJECT, "debian-12-bookworm-v20240415", Some("debian-12"), 10);
        fake.add_image("debian-cloud", "debian-12-bookworm-v20240415", Some("debian-12"), 10);
        fake.add_image(
            "windows-cloud",
            "windows-server-2022-dc-v20240415",
            Some("windows-2022"),
            50,
        );
        fake
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake compute state poisoned")
    }

    pub fn add_machine_type(&self, name: &str) {
        self.state().machine_types.insert(name.to_string());
    }

    pub fn add_network(&self, name: &str, subnetworks: &[String]) {
        self.state().networks.insert(
            name.to_string(),
            Network {
                name: name.to_string(),
                self_link: format!("{API}/{PROJECT}/global/networks/{name}"),
                subnetworks: subnetworks.to_vec(),
            },
        );
    }

    pub fn add_subnetwork(&self, region: &str, name: &str, network: &str) {
        self.state().subnetworks.insert(
            (region.to_string(), name.to_string()),
            Subnetwork {
                name: name.to_string(),
                self_link: format!("{API}/{PROJECT}/regions/{region}/subnetworks/{name}"),
                network: format!("{API}/{PROJECT}/global/networks/{network}"),
                region: Some(format!("{API}/{PROJECT}/regions/{region}")),
            },
        );
    }

    /// Add an image; with a family it also becomes that family's latest.
    pub fn add_image(&self, project: &str, name: &str, family: Option<&str>, disk_size_gb: u64) {
        let mut state = self.state();
        state.images.insert(
            (project.to_string(), name.to_string()),
            Image {
                name: name.to_string(),
                self_link: format!("{API}/{project}/global/images/{name}"),
                family: family.map(str::to_string),
                disk_size_gb,
                deprecated: None,
                creation_timestamp: None,
            },
        );
        if let Some(family) = family {
            state
                .families
                .insert((project.to_string(), family.to_string()), name.to_string());
        }
    }

    /// Mark an image deprecated without removing it
    pub fn deprecate_image(&self, project: &str, name: &str) {
        if let Some(image) = self
            .state()
            .images
            .get_mut(&(project.to_string(), name.to_string()))
        {
            image.deprecated = Some(Deprecation {
                state: "DEPRECATED".into(),
            });
        }
    }

    pub fn add_firewall(&self, firewall: Firewall) {
        self.state()
            .firewalls
            .insert(firewall.name.clone(), firewall);
    }

    pub fn add_instance(&self, instance: Instance) {
        self.state()
            .instances
            .insert(instance.name.clone(), instance);
    }

    pub fn add_disk(&self, disk: Disk) {
        self.state().disks.insert(disk.name.clone(), disk);
    }

    /// Backdate whichever resource is called `name`.
    pub fn set_created(&self, name: &str, timestamp: &str) {
        let mut state = self.state();
        let ts = Some(timestamp.to_string());
        if let Some(i) = state.instances.get_mut(name) {
            i.creation_timestamp = ts.clone();
        }
        if let Some(d) = state.disks.get_mut(name) {
            d.creation_timestamp = ts.clone();
        }
        if let Some(f) = state.firewalls.get_mut(name) {
            f.creation_timestamp = ts;
        }
    }

    /// New instances come up without a NAT address.
    pub fn without_external_ip(&self) {
        self.state().no_external_ip = true;
    }

    pub fn inject(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    /// Every call so far, as `"<method> <resource>"`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of calls to `method`
    pub fn count(&self, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(method))
            .count()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.state().instances.values().cloned().collect()
    }

    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.state().instances.get(name).cloned()
    }

    pub fn firewalls(&self) -> Vec<Firewall> {
        self.state().firewalls.values().cloned().collect()
    }

    pub fn firewall(&self, name: &str) -> Option<Firewall> {
        self.state().firewalls.get(name).cloned()
    }

    pub fn disks(&self) -> Vec<Disk> {
        self.state().disks.values().cloned().collect()
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn get_image(&self, project: &str, name: &str) -> Result<Image> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) = state.enter("get_image", name) {
            return Err(Error::Api { status, message });
        }
        state
            .images
            .get(&(project.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(&format!("projects/{project}/global/images/{name}")))
    }

    async fn get_image_from_family(&self, project: &str, family: &str) -> Result<Image> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) =
            state.enter("get_image_from_family", family)
        {
            return Err(Error::Api { status, message });
        }
        let name = state
            .families
            .get(&(project.to_string(), family.to_string()))
            .cloned()
            .ok_or_else(|| not_found(&format!("projects/{project}/global/images/family/{family}")))?;
        state
            .images
            .get(&(project.to_string(), name))
            .cloned()
            .ok_or_else(|| not_found(family))
    }

    async fn get_machine_type(&self, project: &str, zone: &str, name: &str) -> Result<MachineType> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) = state.enter("get_machine_type", name) {
            return Err(Error::Api { status, message });
        }
        if !state.machine_types.contains(name) {
            return Err(not_found(&format!("projects/{project}/zones/{zone}/machineTypes/{name}")));
        }
        Ok(MachineType {
            name: name.to_string(),
            self_link: format!("{API}/{project}/zones/{zone}/machineTypes/{name}"),
        })
    }

    async fn get_network(&self, _project: &str, name: &str) -> Result<Network> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) = state.enter("get_network", name) {
            return Err(Error::Api { status, message });
        }
        state
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn get_subnetwork(&self, _project: &str, region: &str, name: &str) -> Result<Subnetwork> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) = state.enter("get_subnetwork", name) {
            return Err(Error::Api { status, message });
        }
        state
            .subnetworks
            .get(&(region.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn get_firewall(&self, _project: &str, name: &str) -> Result<Firewall> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) = state.enter("get_firewall", name) {
            return Err(Error::Api { status, message });
        }
        state
            .firewalls
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn insert_firewall(&self, _project: &str, firewall: &Firewall) -> Result<Operation> {
        let mut state = self.state();
        let fault = state.enter("insert_firewall", &firewall.name);
        if !blocks_effect(&fault) {
            if state.firewalls.contains_key(&firewall.name) {
                return Err(already_exists(&firewall.name));
            }
            let mut stored = firewall.clone();
            stored.creation_timestamp = Some(chrono::Utc::now().to_rfc3339());
            state.firewalls.insert(firewall.name.clone(), stored);
        }
        state.operation(&firewall.name, false, fault)
    }

    async fn patch_firewall(
        &self,
        _project: &str,
        name: &str,
        firewall: &Firewall,
    ) -> Result<Operation> {
        let mut state = self.state();
        let fault = state.enter("patch_firewall", name);
        if !blocks_effect(&fault) {
            let Some(existing) = state.firewalls.get_mut(name) else {
                return Err(not_found(name));
            };
            let created = existing.creation_timestamp.clone();
            *existing = Firewall {
                name: name.to_string(),
                creation_timestamp: created,
                ..firewall.clone()
            };
        }
        state.operation(name, false, fault)
    }

    async fn delete_firewall(&self, _project: &str, name: &str) -> Result<Operation> {
        let mut state = self.state();
        let fault = state.enter("delete_firewall", name);
        if !blocks_effect(&fault) && state.firewalls.remove(name).is_none() {
            return Err(not_found(name));
        }
        state.operation(name, false, fault)
    }

    async fn list_firewalls(&self, _project: &str, filter: Option<&str>) -> Result<Vec<Firewall>> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) = state.enter("list_firewalls", filter.unwrap_or("")) {
            return Err(Error::Api { status, message });
        }

        let excluded: Vec<&str> = filter
            .map(|f| {
                f.split(" AND ")
                    .filter_map(|clause| clause.trim().strip_prefix("name != "))
                    .collect()
            })
            .unwrap_or_default();

        Ok(state
            .firewalls
            .values()
            .filter(|fw| !excluded.contains(&fw.name.as_str()))
            .cloned()
            .collect())
    }

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation> {
        let mut state = self.state();
        let fault = state.enter("insert_instance", &instance.name);
        if !blocks_effect(&fault) {
            if state.instances.contains_key(&instance.name) {
                return Err(already_exists(&instance.name));
            }
            if !state
                .machine_types
                .contains(last_segment(&instance.machine_type))
            {
                return Err(Error::Api {
                    status: 400,
                    message: format!("Invalid value for field 'resource.machineType': '{}'", instance.machine_type),
                });
            }

            let now = chrono::Utc::now().to_rfc3339();
            let mut stored = instance.clone();
            stored.creation_timestamp = Some(now.clone());
            stored.status = Some("RUNNING".into());
            stored.tags.get_or_insert_with(Tags::default).fingerprint = Some(state.fingerprint());
            stored.metadata = Some(Metadata {
                items: Vec::new(),
                fingerprint: Some(state.fingerprint()),
            });

            state.next_ip += 1;
            let ip = format!("203.0.113.{}", state.next_ip);
            let no_ip = state.no_external_ip;
            for nic in &mut stored.network_interfaces {
                for ac in &mut nic.access_configs {
                    ac.nat_ip = (!no_ip).then(|| ip.clone());
                }
            }

            state.disks.insert(
                instance.name.clone(),
                Disk {
                    name: instance.name.clone(),
                    creation_timestamp: Some(now),
                    users: vec![format!("{API}/{project}/zones/{zone}/instances/{}", instance.name)],
                },
            );
            state.instances.insert(instance.name.clone(), stored);
        }
        state.operation(&instance.name, true, fault)
    }

    async fn get_instance(&self, _project: &str, _zone: &str, name: &str) -> Result<Instance> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) = state.enter("get_instance", name) {
            return Err(Error::Api { status, message });
        }
        state
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn delete_instance(&self, _project: &str, _zone: &str, name: &str) -> Result<Operation> {
        let mut state = self.state();
        let fault = state.enter("delete_instance", name);
        if !blocks_effect(&fault) {
            if state.instances.remove(name).is_none() {
                return Err(not_found(name));
            }
            let link_suffix = format!("/instances/{name}");
            state.disks.retain(|_, d| !d.users.iter().any(|u| u.ends_with(&link_suffix)));
        }
        state.operation(name, true, fault)
    }

    async fn list_instances(&self, _project: &str, _zone: &str) -> Result<Vec<Instance>> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) = state.enter("list_instances", "") {
            return Err(Error::Api { status, message });
        }
        Ok(state.instances.values().cloned().collect())
    }

    async fn set_instance_metadata(
        &self,
        _project: &str,
        _zone: &str,
        name: &str,
        metadata: &Metadata,
    ) -> Result<Operation> {
        let mut state = self.state();
        let fault = state.enter("set_instance_metadata", name);
        if !blocks_effect(&fault) {
            let fingerprint = state.fingerprint();
            let Some(instance) = state.instances.get_mut(name) else {
                return Err(not_found(name));
            };
            let current = instance.metadata.as_ref().and_then(|m| m.fingerprint.clone());
            if current != metadata.fingerprint {
                return Err(Error::Api {
                    status: 412,
                    message: "Supplied fingerprint does not match current metadata fingerprint."
                        .into(),
                });
            }
            instance.metadata = Some(Metadata {
                items: metadata.items.clone(),
                fingerprint: Some(fingerprint),
            });
        }
        state.operation(name, true, fault)
    }

    async fn set_instance_tags(
        &self,
        _project: &str,
        _zone: &str,
        name: &str,
        tags: &Tags,
    ) -> Result<Operation> {
        let mut state = self.state();
        let fault = state.enter("set_instance_tags", name);
        if !blocks_effect(&fault) {
            let fingerprint = state.fingerprint();
            let Some(instance) = state.instances.get_mut(name) else {
                return Err(not_found(name));
            };
            let current = instance.tags.as_ref().and_then(|t| t.fingerprint.clone());
            if current != tags.fingerprint {
                return Err(Error::Api {
                    status: 412,
                    message: "Supplied fingerprint does not match current tags fingerprint."
                        .into(),
                });
            }
            instance.tags = Some(Tags {
                items: tags.items.clone(),
                fingerprint: Some(fingerprint),
            });
        }
        state.operation(name, true, fault)
    }

    async fn list_disks(&self, _project: &str, _zone: &str) -> Result<Vec<Disk>> {
        let mut state = self.state();
        if let Some(FaultKind::Http { status, message }) = state.enter("list_disks", "") {
            return Err(Error::Api { status, message });
        }
        Ok(state.disks.values().cloned().collect())
    }

    async fn delete_disk(&self, _project: &str, _zone: &str, name: &str) -> Result<Operation> {
        let mut state = self.state();
        let fault = state.enter("delete_disk", name);
        if !blocks_effect(&fault) {
            match state.disks.get(name) {
                None => return Err(not_found(name)),
                Some(disk) if !disk.users.is_empty() => {
                    return Err(Error::Api {
                        status: 400,
                        message: format!("The disk resource '{name}' is already being used"),
                    });
                }
                Some(_) => {
                    state.disks.remove(name);
                }
            }
        }
        state.operation(name, true, fault)
    }

    async fn wait_operation(
        &self,
        _project: &str,
        operation: &Operation,
        deadline: Duration,
    ) -> Result<Operation> {
        let mut state = self.state();
        state.enter("wait_operation", &operation.name);

        let Some((stored, timeout)) = state.operations.get(&operation.name).cloned() else {
            return Err(not_found(&operation.name));
        };
        if timeout {
            return Err(Error::OperationTimeout {
                operation: operation.name.clone(),
                waited: deadline,
            });
        }

        Ok(Operation {
            status: OperationStatus::Done,
            ..stored
        })
    }
}
