//! Table registry.
//!
//! Group 0 is served by one fixed TCAM table per direction. Every other
//! group gets an exact-match table (Fet) allocated on demand, with the
//! first rule's mask as its key template, and freed when its last
//! reference goes away. A JUMP to a group with no open table lands on the
//! per-direction default table until the group's own table appears.
//!
//! Tables live in an arena addressed by [`FetId`]; flows and pending jumps
//! hold ids, never the tables themselves.

use std::collections::HashMap;
use std::fmt;

use flowman_dev::{Direction, FlowApi, KeyTemplate, MatchKey, TableHandle};
use log::{debug, error, info, warn};

use crate::config::FlowManagerConfig;
use crate::error::{FlowError, Result};

/// Arena index of a [`Fet`]. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetId(pub u32);

impl fmt::Display for FetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fet{}", self.0)
    }
}

/// Exact-match table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fet {
    pub handle: TableHandle,
    /// Group served. Meaningless for default tables, which serve any group
    /// with a pending jump.
    pub group: u32,
    pub direction: Direction,
    pub key: KeyTemplate,
    pub is_default: bool,
    ref_count: u32,
}

impl Fet {
    fn new(handle: TableHandle, group: u32, direction: Direction, key: KeyTemplate) -> Self {
        Self {
            handle,
            group,
            direction,
            key,
            is_default: false,
            ref_count: 0,
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Increments the reference count and returns the new value.
    pub fn increment_ref(&mut self) -> u32 {
        self.ref_count = self.ref_count.saturating_add(1);
        self.ref_count
    }

    /// Decrements the reference count and returns the new value.
    ///
    /// Returns 0 if the count was already 0 (underflow protection).
    pub fn decrement_ref(&mut self) -> u32 {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

impl fmt::Display for Fet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default {
            write!(f, "default {} table {}", self.direction, self.handle)?;
        } else {
            write!(
                f,
                "{} table {} group={}",
                self.direction, self.handle, self.group
            )?;
        }
        write!(f, " ref={}", self.ref_count)
    }
}

/// Tracks the TCAM tables, default tables and open exact-match tables.
#[derive(Debug)]
pub struct TableRegistry {
    fets: HashMap<FetId, Fet>,
    open: HashMap<(u32, Direction), FetId>,
    defaults: [Option<FetId>; 2],
    tcam: [TableHandle; 2],
    next_id: u32,
    tcam_table_size: u32,
    exact_table_size: u32,
    default_table_size: u32,
    max_exact_tables: usize,
    device_valid: bool,
    tables_created: u64,
    tables_freed: u64,
}

impl TableRegistry {
    pub fn new(config: &FlowManagerConfig) -> Self {
        Self {
            fets: HashMap::new(),
            open: HashMap::new(),
            defaults: [None, None],
            tcam: [TableHandle::NULL; 2],
            next_id: 0,
            tcam_table_size: config.tcam_table_size,
            exact_table_size: config.exact_table_size,
            default_table_size: config.default_table_size,
            max_exact_tables: config.max_exact_tables,
            device_valid: false,
            tables_created: 0,
            tables_freed: 0,
        }
    }

    fn insert(&mut self, fet: Fet) -> FetId {
        let id = FetId(self.next_id);
        self.next_id += 1;
        self.fets.insert(id, fet);
        id
    }

    /// Allocates both TCAM tables and both default tables. On failure the
    /// tables allocated so far are freed again.
    pub fn init<D: FlowApi>(&mut self, device: &mut D) -> Result<()> {
        self.device_valid = true;
        if let Err(e) = self.alloc_fixed(device) {
            error!("FlowManager: table init failed: {}", e);
            if let Err(e) = self.shutdown(device) {
                warn!("FlowManager: cleanup after failed init: {}", e);
            }
            return Err(e);
        }
        info!(
            "FlowManager: TCAM tables {} (ingress) {} (egress), {} default tables",
            self.tcam[0],
            self.tcam[1],
            self.defaults.iter().flatten().count()
        );
        Ok(())
    }

    fn alloc_fixed<D: FlowApi>(&mut self, device: &mut D) -> Result<()> {
        for direction in Direction::ALL {
            self.tcam[direction.index()] =
                device.tcam_table_alloc(direction, self.tcam_table_size)?;
        }
        let key = KeyTemplate::default_key();
        for direction in Direction::ALL {
            let handle = device.exact_table_alloc(direction, self.default_table_size, &key)?;
            let mut fet = Fet::new(handle, 0, direction, key);
            fet.is_default = true;
            // Pinned for the registry's lifetime.
            fet.increment_ref();
            let id = self.insert(fet);
            self.defaults[direction.index()] = Some(id);
        }
        Ok(())
    }

    /// TCAM table serving group 0 in `direction`.
    pub fn tcam_handle(&self, direction: Direction) -> TableHandle {
        self.tcam[direction.index()]
    }

    pub fn default_table(&self, direction: Direction) -> Option<FetId> {
        self.defaults[direction.index()]
    }

    pub fn get(&self, id: FetId) -> Option<&Fet> {
        self.fets.get(&id)
    }

    pub fn handle(&self, id: FetId) -> Option<TableHandle> {
        self.fets.get(&id).map(|fet| fet.handle)
    }

    /// Open table of (group, direction), if any.
    pub fn lookup(&self, group: u32, direction: Direction) -> Option<FetId> {
        self.open.get(&(group, direction)).copied()
    }

    /// Number of open exact-match tables, default tables excluded.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Open tables in (group, direction) order.
    pub fn open_tables(&self) -> Vec<(FetId, &Fet)> {
        let mut tables: Vec<_> = self
            .open
            .values()
            .filter_map(|id| self.fets.get(id).map(|fet| (*id, fet)))
            .collect();
        tables.sort_by_key(|(_, fet)| (fet.group, fet.direction.index()));
        tables
    }

    pub fn tables_created(&self) -> u64 {
        self.tables_created
    }

    pub fn tables_freed(&self) -> u64 {
        self.tables_freed
    }

    pub fn is_device_valid(&self) -> bool {
        self.device_valid
    }

    /// Marks every table handle dead. Later releases skip the device.
    pub fn invalidate(&mut self) {
        if self.device_valid {
            info!("FlowManager: device closed, table handles invalidated");
        }
        self.device_valid = false;
    }

    /// Takes a reference on the table serving (group, direction).
    ///
    /// An open table is shared whatever `key` says. Without an open table,
    /// `None` selects the default table and `Some` allocates a new table
    /// with that key. The returned flag is true for a new table.
    pub fn get_table<D: FlowApi>(
        &mut self,
        group: u32,
        direction: Direction,
        key: Option<&KeyTemplate>,
        device: &mut D,
    ) -> Result<(FetId, bool)> {
        if let Some(id) = self.lookup(group, direction) {
            let fet = self.fet_mut(id)?;
            let refs = fet.increment_ref();
            debug!(
                "FlowManager: get {} group {} table, ref={}",
                direction, group, refs
            );
            return Ok((id, false));
        }

        let Some(key) = key else {
            let id = self.default_table(direction).ok_or(FlowError::TableResourceExhausted {
                group,
                direction,
                source: None,
            })?;
            let refs = self.fet_mut(id)?.increment_ref();
            debug!(
                "FlowManager: jump to group {} parked on default {} table, ref={}",
                group, direction, refs
            );
            return Ok((id, false));
        };

        if self.open.len() >= self.max_exact_tables {
            warn!(
                "FlowManager: {} exact-match tables open, cannot add group {}",
                self.open.len(),
                group
            );
            return Err(FlowError::TableResourceExhausted {
                group,
                direction,
                source: None,
            });
        }

        let handle = device
            .exact_table_alloc(direction, self.exact_table_size, key)
            .map_err(|e| {
                error!(
                    "FlowManager: cannot allocate {} table for group {}: {}",
                    direction, group, e
                );
                FlowError::TableResourceExhausted {
                    group,
                    direction,
                    source: Some(e),
                }
            })?;

        let mut fet = Fet::new(handle, group, direction, *key);
        fet.increment_ref();
        let id = self.insert(fet);
        self.open.insert((group, direction), id);
        self.tables_created += 1;
        info!(
            "FlowManager: created {} table {} for group {}",
            direction, handle, group
        );
        Ok((id, true))
    }

    /// Takes one more reference on a table already held.
    pub fn hold(&mut self, id: FetId) -> Result<u32> {
        Ok(self.fet_mut(id)?.increment_ref())
    }

    /// Drops a reference. A non-default table is freed at zero.
    pub fn put_table<D: FlowApi>(&mut self, id: FetId, device: &mut D) -> Result<()> {
        let device_valid = self.device_valid;
        let fet = self.fet_mut(id)?;
        if fet.is_default && fet.ref_count() <= 1 {
            warn!("FlowManager: unbalanced put on {}", fet);
            return Ok(());
        }
        let refs = fet.decrement_ref();
        debug!("FlowManager: put {}", fet);
        if refs > 0 || fet.is_default {
            return Ok(());
        }

        let (group, direction, handle) = (fet.group, fet.direction, fet.handle);
        self.fets.remove(&id);
        self.open.remove(&(group, direction));
        self.tables_freed += 1;
        info!(
            "FlowManager: freeing {} table {} of group {}",
            direction, handle, group
        );
        if device_valid {
            device.table_free(handle).map_err(|e| {
                error!("FlowManager: failed to free table {}: {}", handle, e);
                FlowError::from(e)
            })?;
        }
        Ok(())
    }

    /// Checks that (group, direction) could be served without changing
    /// anything. `key` is the rule's own key, or `None` for a JUMP target.
    /// A rule joining an open table must carry the table's key.
    pub fn resolve_dry(
        &self,
        group: u32,
        direction: Direction,
        key: Option<&MatchKey>,
    ) -> Result<()> {
        let exhausted = FlowError::TableResourceExhausted {
            group,
            direction,
            source: None,
        };
        if let Some(id) = self.lookup(group, direction) {
            let fet = self.fets.get(&id).ok_or(exhausted)?;
            if key.is_some_and(|key| !fet.key.matches(key)) {
                return Err(FlowError::KeyMismatch { group, direction });
            }
            return Ok(());
        }
        match key {
            None if self.default_table(direction).is_some() => Ok(()),
            Some(_) if self.open.len() < self.max_exact_tables => Ok(()),
            _ => Err(exhausted),
        }
    }

    /// Frees every table: open ones, the defaults, then the TCAM tables.
    /// Returns the first device failure after trying them all.
    pub fn shutdown<D: FlowApi>(&mut self, device: &mut D) -> Result<()> {
        let mut handles: Vec<TableHandle> = self
            .open_tables()
            .iter()
            .map(|(_, fet)| fet.handle)
            .collect();
        handles.extend(
            self.defaults
                .iter()
                .flatten()
                .filter_map(|id| self.handle(*id)),
        );
        handles.extend(self.tcam.iter().copied().filter(|h| !h.is_null()));

        let mut first_err = None;
        if self.device_valid {
            for handle in handles {
                if let Err(e) = device.table_free(handle) {
                    error!("FlowManager: failed to free table {}: {}", handle, e);
                    first_err.get_or_insert(FlowError::from(e));
                }
            }
        }

        self.fets.clear();
        self.open.clear();
        self.defaults = [None, None];
        self.tcam = [TableHandle::NULL; 2];
        self.device_valid = false;
        first_err.map_or(Ok(()), Err)
    }

    fn fet_mut(&mut self, id: FetId) -> Result<&mut Fet> {
        self.fets
            .get_mut(&id)
            .ok_or_else(|| FlowError::Unsupported(format!("unknown table {}", id)))
    }
}
