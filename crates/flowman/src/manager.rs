//! FlowManager - rule lifecycle.
//!
//! The manager owns every piece of mutable state: the device channel, the
//! table registry, the counter pool, the pending jumps and the live flows.
//! Each operation runs to completion on the caller's thread. A failed
//! `create` releases everything it acquired before returning.

use std::collections::BTreeMap;
use std::fmt;

use flowman_dev::{
    ActionHandle, ActionProgram, CounterId, CounterStats, DeviceChannel, Direction, EntryHandle,
    ExactEntry, FlowApi, KeyTemplate, MatchEntry, TableHandle,
};
use log::{debug, error, info, warn};

use crate::action::FlowAction;
use crate::compiler::{compile, ActionContext, CompiledFlow, ConfiguredPorts, DeviceVnics};
use crate::config::FlowManagerConfig;
use crate::counter::CounterPool;
use crate::error::{FlowError, Result};
use crate::item::FlowItem;
use crate::jump::{JumpConversion, JumpFlow, JumpResolver};
use crate::table::{FetId, TableRegistry};
use crate::types::{FlowAttr, FlowId, FlowState, TCAM_GROUP};

/// Operation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowManagerStats {
    pub flows_created: u64,
    pub flows_destroyed: u64,
    pub create_failures: u64,
    pub tables_created: u64,
    pub tables_freed: u64,
    pub jump_flows_noted: u64,
    pub jump_flows_converted: u64,
    pub jump_flows_failed: u64,
    /// Device failures tolerated while releasing flows.
    pub release_errors: u64,
}

/// An installed rule and the device resources it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub id: FlowId,
    pub direction: Direction,
    pub group: u32,
    /// Entry as installed, action and counter filled in.
    pub entry: MatchEntry,
    pub program: ActionProgram,
    /// Table reference held: the rule's own exact-match table for groups
    /// above 0, the jump target for group-0 JUMP rules.
    pub fet: Option<FetId>,
    pub entry_handle: EntryHandle,
    pub action_handle: ActionHandle,
    pub counter: Option<CounterId>,
    pub jump_group: Option<u32>,
    pub state: FlowState,
}

impl FlowRule {
    fn new(id: FlowId, compiled: &CompiledFlow) -> Self {
        Self {
            id,
            direction: compiled.direction,
            group: compiled.group,
            entry: compiled.entry.clone(),
            program: compiled.program.clone(),
            fet: None,
            entry_handle: EntryHandle::NULL,
            action_handle: ActionHandle::NULL,
            counter: None,
            jump_group: compiled.jump_group,
            state: FlowState::Uninstalled,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.state == FlowState::Installed
    }
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} group={} {} entry={} [{}] {}",
            self.id,
            self.direction,
            self.group,
            self.state,
            self.entry_handle,
            self.program,
            self.entry
        )
    }
}

/// Flow manager over one device channel.
pub struct FlowManager<C: DeviceChannel> {
    config: FlowManagerConfig,
    pub(crate) device: C,
    pub(crate) tables: TableRegistry,
    counters: CounterPool,
    pub(crate) jumps: JumpResolver,
    last_conversion: JumpConversion,
    pub(crate) flows: BTreeMap<FlowId, FlowRule>,
    next_flow_id: u64,
    pub(crate) stats: FlowManagerStats,
}

impl<C: DeviceChannel> fmt::Debug for FlowManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowManager")
            .field("flows", &self.flows.len())
            .field("open_tables", &self.tables.open_count())
            .field("pending_jumps", &self.jumps.len())
            .field("counters", &self.counters.allocated())
            .finish()
    }
}

impl<C: DeviceChannel> FlowManager<C> {
    /// Brings up the flow manager: TCAM tables, default tables and the first
    /// counter block.
    pub fn new(config: FlowManagerConfig, mut device: C) -> Result<Self> {
        config
            .validate()
            .map_err(|e| FlowError::Config(e.to_string()))?;

        let mut tables = TableRegistry::new(&config);
        tables.init(&mut device)?;

        let mut counters = CounterPool::new(config.counters_expand, config.max_counters);
        if let Err(e) = counters.grow(&mut device) {
            error!("FlowManager: initial counter block failed: {}", e);
            if let Err(e) = tables.shutdown(&mut device) {
                warn!("FlowManager: cleanup after failed init: {}", e);
            }
            return Err(e);
        }

        info!(
            "FlowManager: initialized with {} counters, {} receive queues",
            counters.allocated(),
            config.rq_count
        );
        Ok(Self {
            config,
            device,
            tables,
            counters,
            jumps: JumpResolver::new(),
            last_conversion: JumpConversion::default(),
            flows: BTreeMap::new(),
            next_flow_id: 1,
            stats: FlowManagerStats::default(),
        })
    }

    fn action_context(&self, attr: &FlowAttr, direction: Direction) -> ActionContext {
        ActionContext {
            direction,
            group: attr.group,
            rq_count: self.config.rq_count,
            rss_hf: self.config.rss_hf,
        }
    }

    /// Compiles and installs a rule.
    pub fn create(
        &mut self,
        attr: &FlowAttr,
        pattern: &[FlowItem],
        actions: &[FlowAction],
    ) -> Result<FlowId> {
        let compiled = match self.compile_rule(attr, pattern, actions) {
            Ok(compiled) => compiled,
            Err(e) => {
                debug!("FlowManager: rejected rule: {}", e);
                self.stats.create_failures = self.stats.create_failures.saturating_add(1);
                return Err(e);
            }
        };

        let id = FlowId(self.next_flow_id);
        self.next_flow_id += 1;
        let mut rule = FlowRule::new(id, &compiled);

        let new_table = match self.install(&mut rule, &compiled) {
            Ok(new_table) => new_table,
            Err(e) => {
                error!("FlowManager: failed to install {}: {}", id, e);
                if let Err(e) = self.release(&mut rule) {
                    warn!("FlowManager: rollback of {}: {}", id, e);
                }
                self.stats.create_failures = self.stats.create_failures.saturating_add(1);
                return Err(e);
            }
        };

        let parked = rule
            .fet
            .and_then(|fet| self.tables.get(fet))
            .is_some_and(|fet| fet.is_default);
        info!("FlowManager: created {}", rule);
        self.flows.insert(id, rule);
        self.stats.flows_created = self.stats.flows_created.saturating_add(1);

        if let (true, Some(group)) = (parked, compiled.jump_group) {
            self.jumps.note_pending(JumpFlow {
                flow: id,
                group,
                direction: compiled.direction,
                entry: compiled.entry,
                program: compiled.program,
            });
            self.stats.jump_flows_noted = self.stats.jump_flows_noted.saturating_add(1);
        }
        if let Some(fet) = new_table {
            self.last_conversion = self.resolve_new_table(fet);
        }
        self.sync_table_stats();
        Ok(id)
    }

    fn compile_rule(
        &mut self,
        attr: &FlowAttr,
        pattern: &[FlowItem],
        actions: &[FlowAction],
    ) -> Result<CompiledFlow> {
        let direction = attr.validate()?;
        let ctx = self.action_context(attr, direction);
        let mut vnics = DeviceVnics {
            ports: &self.config.ports,
            device: &mut self.device,
        };
        compile(pattern, actions, &ctx, &mut vnics)
    }

    /// Acquires the rule's device resources. Whatever was acquired stays
    /// recorded in `rule` so a failure can be unwound with `release`.
    /// Returns the table created for the rule, if any.
    fn install(&mut self, rule: &mut FlowRule, compiled: &CompiledFlow) -> Result<Option<FetId>> {
        let direction = compiled.direction;
        let mut program = compiled.program.clone();
        let mut entry = compiled.entry.clone();
        let mut new_table = None;

        if let Some(target) = compiled.jump_group {
            let (fet, _) = self
                .tables
                .get_table(target, direction, None, &mut self.device)?;
            rule.fet = Some(fet);
            let handle = self.table_handle(fet, target, direction)?;
            program.retarget_jump(handle);
        }

        rule.action_handle = self.device.action_alloc(&program)?;
        entry.action = rule.action_handle;

        if compiled.counted() {
            let counter = self.counters.alloc(&mut self.device)?;
            rule.counter = Some(counter);
            entry.counter = Some(counter);
        }

        if compiled.group == TCAM_GROUP {
            let tcam = self.tables.tcam_handle(direction);
            rule.entry_handle = self.device.tcam_entry_install(tcam, &entry)?;
        } else {
            let template = KeyTemplate::from_mask(&entry.key);
            let (fet, created) =
                self.tables
                    .get_table(compiled.group, direction, Some(&template), &mut self.device)?;
            rule.fet = Some(fet);
            if created {
                new_table = Some(fet);
            }
            let table = self
                .tables
                .get(fet)
                .ok_or(FlowError::TableResourceExhausted {
                    group: compiled.group,
                    direction,
                    source: None,
                })?;
            if !table.key.matches(&entry.key) {
                return Err(FlowError::KeyMismatch {
                    group: compiled.group,
                    direction,
                });
            }
            let handle = table.handle;
            rule.entry_handle = self
                .device
                .exact_entry_install(handle, &ExactEntry::from(&entry))?;
        }

        // The device only clears counters that are in use by an entry.
        if let Some(counter) = rule.counter {
            self.counters.zero(&mut self.device, counter)?;
        }

        rule.entry = entry;
        rule.program = program;
        rule.state = FlowState::Installed;
        Ok(new_table)
    }

    fn table_handle(
        &self,
        fet: FetId,
        group: u32,
        direction: Direction,
    ) -> Result<TableHandle> {
        self.tables
            .handle(fet)
            .ok_or(FlowError::TableResourceExhausted {
                group,
                direction,
                source: None,
            })
    }

    /// Frees the rule's entry and action on the device. Failures are logged
    /// and counted; the first one is returned after both were tried.
    pub(crate) fn release_device_objects(&mut self, rule: &mut FlowRule) -> Result<()> {
        let device_valid = self.tables.is_device_valid();
        let mut first_err = None;

        if !rule.entry_handle.is_null() {
            if device_valid {
                if let Err(e) = self.device.entry_remove(rule.entry_handle) {
                    error!(
                        "FlowManager: failed to remove entry {} of {}: {}",
                        rule.entry_handle, rule.id, e
                    );
                    self.stats.release_errors = self.stats.release_errors.saturating_add(1);
                    first_err.get_or_insert(FlowError::from(e));
                }
            }
            rule.entry_handle = EntryHandle::NULL;
        }

        if !rule.action_handle.is_null() {
            if device_valid {
                if let Err(e) = self.device.action_free(rule.action_handle) {
                    error!(
                        "FlowManager: failed to free action {} of {}: {}",
                        rule.action_handle, rule.id, e
                    );
                    self.stats.release_errors = self.stats.release_errors.saturating_add(1);
                    first_err.get_or_insert(FlowError::from(e));
                }
            }
            rule.action_handle = ActionHandle::NULL;
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Removes the rule's entry and action, tolerating device failures.
    /// The counter and table reference stay with the rule.
    pub(crate) fn release_entry(&mut self, rule: &mut FlowRule) {
        if let Err(e) = self.release_device_objects(rule) {
            warn!("FlowManager: tolerated release failure for {}: {}", rule.id, e);
        }
        rule.state = FlowState::Uninstalled;
    }

    /// Releases entry, action, counter and table reference, in that order.
    fn release(&mut self, rule: &mut FlowRule) -> Result<()> {
        let mut result = self.release_device_objects(rule);

        if let Some(counter) = rule.counter.take() {
            self.counters.free(counter);
        }

        if let Some(fet) = rule.fet.take() {
            if let Err(e) = self.tables.put_table(fet, &mut self.device) {
                self.stats.release_errors = self.stats.release_errors.saturating_add(1);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        rule.state = FlowState::Uninstalled;
        result
    }

    /// Destroys a flow. Destroying an unknown or already destroyed flow is
    /// a no-op.
    pub fn destroy(&mut self, id: FlowId) -> Result<()> {
        let Some(mut rule) = self.flows.remove(&id) else {
            warn!("FlowManager: destroy of unknown {}", id);
            return Ok(());
        };
        if self.jumps.remove_flow(id) {
            debug!("FlowManager: {} no longer waits for its jump target", id);
        }
        let result = self.release(&mut rule);
        self.stats.flows_destroyed = self.stats.flows_destroyed.saturating_add(1);
        self.sync_table_stats();
        info!("FlowManager: destroyed {}", id);
        result
    }

    /// Destroys every flow. With the device already closed only software
    /// state is released.
    pub fn flush(&mut self) -> Result<()> {
        if !self.tables.is_device_valid() {
            warn!(
                "FlowManager: flushing {} flows without a device",
                self.flows.len()
            );
        }
        let ids: Vec<FlowId> = self.flows.keys().copied().collect();
        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.destroy(id) {
                first_err.get_or_insert(e);
            }
        }
        self.jumps.clear();
        first_err.map_or(Ok(()), Err)
    }

    /// Reads a flow's counter. Fails `Unsupported` for a flow created
    /// without COUNT.
    pub fn query_count(&mut self, id: FlowId, reset: bool) -> Result<CounterStats> {
        let rule = self.flows.get(&id).ok_or(FlowError::FlowNotFound(id))?;
        let counter = rule
            .counter
            .ok_or_else(|| FlowError::Unsupported(format!("{} has no COUNT action", id)))?;
        if !self.tables.is_device_valid() {
            return Err(FlowError::Unsupported("device is closed".to_string()));
        }
        Ok(self.device.counter_query(counter, reset)?)
    }

    /// Runs query actions against a flow. Only COUNT can be queried; the
    /// result of the COUNT action is returned.
    pub fn query(
        &mut self,
        id: FlowId,
        actions: &[FlowAction],
        reset: bool,
    ) -> Result<Option<CounterStats>> {
        let mut result = None;
        for action in actions {
            match action {
                FlowAction::Void => {}
                FlowAction::Count => result = Some(self.query_count(id, reset)?),
                other => {
                    return Err(FlowError::Unsupported(format!(
                        "{} cannot be queried",
                        other.action_type()
                    )))
                }
            }
        }
        Ok(result)
    }

    /// Checks that a rule would be accepted, without touching the device or
    /// changing any state.
    pub fn validate(
        &self,
        attr: &FlowAttr,
        pattern: &[FlowItem],
        actions: &[FlowAction],
    ) -> Result<()> {
        let direction = attr.validate()?;
        let ctx = self.action_context(attr, direction);
        let mut ports = ConfiguredPorts {
            ports: &self.config.ports,
        };
        let compiled = compile(pattern, actions, &ctx, &mut ports)?;
        if let Some(target) = compiled.jump_group {
            self.tables.resolve_dry(target, direction, None)?;
        }
        if compiled.group != TCAM_GROUP {
            self.tables
                .resolve_dry(compiled.group, direction, Some(&compiled.entry.key))?;
        }
        Ok(())
    }

    /// Records that the device is gone. Later releases only update
    /// software state.
    pub fn device_closed(&mut self) {
        self.tables.invalidate();
    }

    /// Flushes every flow, then frees the tables and counters.
    pub fn shutdown(&mut self) -> Result<()> {
        let mut result = self.flush();
        let device_valid = self.tables.is_device_valid();

        if device_valid {
            if let Err(e) = self.counters.release_all(&mut self.device) {
                error!("FlowManager: failed to release counters: {}", e);
                result = result.and(Err(e));
            }
        } else {
            self.counters.forget();
        }
        if let Err(e) = self.tables.shutdown(&mut self.device) {
            result = result.and(Err(e));
        }
        self.sync_table_stats();
        info!("FlowManager: shut down");
        result
    }

    /// Hands the device channel back.
    pub fn into_device(self) -> C {
        self.device
    }

    fn sync_table_stats(&mut self) {
        self.stats.tables_created = self.tables.tables_created();
        self.stats.tables_freed = self.tables.tables_freed();
    }

    pub fn flow(&self, id: FlowId) -> Option<&FlowRule> {
        self.flows.get(&id)
    }

    /// Live flows in creation order.
    pub fn flows(&self) -> impl Iterator<Item = &FlowRule> {
        self.flows.values()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    pub fn counters(&self) -> &CounterPool {
        &self.counters
    }

    pub fn pending_jump_count(&self) -> usize {
        self.jumps.len()
    }

    pub fn is_jump_pending(&self, id: FlowId) -> bool {
        self.jumps.is_pending(id)
    }

    /// State of a flow. Ids are never reused, so an id handed out earlier
    /// and no longer live is `Destroyed`; an id never handed out is `None`.
    pub fn flow_state(&self, id: FlowId) -> Option<FlowState> {
        match self.flows.get(&id) {
            Some(rule) => Some(rule.state),
            None if id.0 > 0 && id.0 < self.next_flow_id => Some(FlowState::Destroyed),
            None => None,
        }
    }

    /// Outcome of the jump conversions run by the latest `create` that
    /// opened a table.
    pub fn last_jump_conversion(&self) -> &JumpConversion {
        &self.last_conversion
    }

    pub fn device(&self) -> &C {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut C {
        &mut self.device
    }

    pub fn stats(&self) -> &FlowManagerStats {
        &self.stats
    }

    pub fn config(&self) -> &FlowManagerConfig {
        &self.config
    }
}
