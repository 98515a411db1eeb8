use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use lodestone_core::rule::ensure_single_rule_type;
use lodestone_core::{
    Action, ChangeEvent, ChangeListener, Dependency, EventPayload, InstanceKey, RegistryError,
    RegistryStore, Result, Rule, Service, ServiceInstance, StoreTransaction,
};

fn db_err(e: rusqlite::Error) -> RegistryError {
    RegistryError::Persistence(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| RegistryError::Internal(e.to_string()))
}

fn from_json<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| RegistryError::Persistence(format!("corrupt row: {}", e)))
}

type Pending = Vec<(Action, EventPayload)>;

/// SQLite-backed registry store. Every committed mutation is reported to the
/// change listener with a revision that keeps increasing across restarts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    listener: RwLock<Option<Arc<dyn ChangeListener>>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_tables(&conn).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            listener: RwLock::new(None),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn ChangeListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn revision(&self) -> Result<i64> {
        current_revision(&self.conn.lock()).map_err(db_err)
    }

    /// Must be called with the connection held. Listeners must not call back
    /// into the store.
    fn emit(&self, events: Vec<(i64, Action, EventPayload)>) {
        let listener = self.listener.read();
        let Some(listener) = listener.as_ref() else {
            return;
        };
        for (revision, action, payload) in events {
            listener.on_change(ChangeEvent::new(action, revision, payload));
        }
    }

    /// Runs `f` in an immediate transaction and emits its events once committed.
    /// Emission happens before the connection is released, so listeners see
    /// revisions in commit order.
    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>, &mut Pending) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut pending = Vec::new();
        let value = f(&tx, &mut pending)?;
        let stamped = stamp(&tx, pending).map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        self.emit(stamped);
        drop(conn);
        Ok(value)
    }
}

fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS services (
            service_id TEXT PRIMARY KEY,
            domain TEXT NOT NULL,
            project TEXT NOT NULL,
            body TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS instances (
            domain TEXT NOT NULL,
            project TEXT NOT NULL,
            service_id TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            refresh_time INTEGER NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (domain, project, service_id, instance_id)
        );
        CREATE INDEX IF NOT EXISTS idx_instances_service ON instances(service_id);
        CREATE TABLE IF NOT EXISTS rules (
            rule_id TEXT PRIMARY KEY,
            service_id TEXT NOT NULL,
            attribute TEXT NOT NULL,
            pattern TEXT NOT NULL,
            body TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rules_service ON rules(service_id);
        CREATE TABLE IF NOT EXISTS dependencies (
            domain TEXT NOT NULL,
            project TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            consumer_id TEXT NOT NULL,
            body TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO meta (key, value) VALUES ('revision', 0);
        ",
    )
}

fn current_revision(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT value FROM meta WHERE key = 'revision'", [], |row| {
        row.get(0)
    })
}

/// Assigns one revision per pending event, inside the writing transaction.
fn stamp(conn: &Connection, pending: Pending) -> rusqlite::Result<Vec<(i64, Action, EventPayload)>> {
    let mut stamped = Vec::with_capacity(pending.len());
    for (action, payload) in pending {
        conn.execute("UPDATE meta SET value = value + 1 WHERE key = 'revision'", [])?;
        stamped.push((current_revision(conn)?, action, payload));
    }
    Ok(stamped)
}

fn read_instance(conn: &Connection, key: &InstanceKey) -> Result<ServiceInstance> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT body, refresh_time FROM instances
             WHERE domain = ?1 AND project = ?2 AND service_id = ?3 AND instance_id = ?4",
            params![
                key.domain_project.domain,
                key.domain_project.project,
                key.service_id,
                key.instance_id
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    let (body, refresh_time) =
        row.ok_or_else(|| RegistryError::InstanceNotFound(key.instance_id.clone()))?;
    let mut instance: ServiceInstance = from_json(&body)?;
    instance.refresh_time = refresh_time as u64;
    Ok(instance)
}

fn remove_instance(conn: &Connection, key: &InstanceKey) -> Result<Option<ServiceInstance>> {
    let instance = match read_instance(conn, key) {
        Ok(instance) => instance,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    conn.execute(
        "DELETE FROM instances
         WHERE domain = ?1 AND project = ?2 AND service_id = ?3 AND instance_id = ?4",
        params![
            key.domain_project.domain,
            key.domain_project.project,
            key.service_id,
            key.instance_id
        ],
    )
    .map_err(db_err)?;
    Ok(Some(instance))
}

fn query_bodies<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let bodies = stmt
        .query_map(args, |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(db_err)?;
    bodies.iter().map(|b| from_json(b)).collect()
}

fn query_instances(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<ServiceInstance>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(args, |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    rows.into_iter()
        .map(|(body, refresh_time)| {
            let mut instance: ServiceInstance = from_json(&body)?;
            instance.refresh_time = refresh_time as u64;
            Ok(instance)
        })
        .collect()
}

impl RegistryStore for SqliteStore {
    fn add_service(&self, service: &Service) -> Result<()> {
        let body = to_json(service)?;
        self.write(|tx, pending| {
            let existed = tx
                .query_row(
                    "SELECT 1 FROM services WHERE service_id = ?1",
                    [&service.service_id],
                    |_| Ok(()),
                )
                .optional()
                .map_err(db_err)?
                .is_some();
            tx.execute(
                "INSERT OR REPLACE INTO services (service_id, domain, project, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    service.service_id,
                    service.domain_project.domain,
                    service.domain_project.project,
                    body
                ],
            )
            .map_err(db_err)?;
            let action = if existed { Action::Update } else { Action::Create };
            pending.push((action, EventPayload::Service(service.clone())));
            Ok(())
        })
    }

    fn get_service(&self, service_id: &str) -> Result<Service> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM services WHERE service_id = ?1",
                [service_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match body {
            Some(body) => from_json(&body),
            None => Err(RegistryError::ServiceNotFound(service_id.to_string())),
        }
    }

    fn get_all_services(&self) -> Result<Vec<Service>> {
        query_bodies(&self.conn.lock(), "SELECT body FROM services", [])
    }

    fn add_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let body = to_json(instance)?;
        self.write(|tx, pending| {
            let existed = match read_instance(tx, &instance.key()) {
                Ok(_) => true,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            tx.execute(
                "INSERT OR REPLACE INTO instances
                 (domain, project, service_id, instance_id, refresh_time, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    instance.domain_project.domain,
                    instance.domain_project.project,
                    instance.service_id,
                    instance.instance_id,
                    instance.refresh_time as i64,
                    body
                ],
            )
            .map_err(db_err)?;
            let action = if existed { Action::Update } else { Action::Create };
            pending.push((action, EventPayload::Instance(instance.clone())));
            Ok(())
        })
    }

    fn get_instance(&self, key: &InstanceKey) -> Result<ServiceInstance> {
        read_instance(&self.conn.lock(), key)
    }

    fn get_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>> {
        query_instances(
            &self.conn.lock(),
            "SELECT body, refresh_time FROM instances WHERE service_id = ?1",
            [service_id],
        )
    }

    fn get_all_instances(&self) -> Result<Vec<ServiceInstance>> {
        query_instances(
            &self.conn.lock(),
            "SELECT body, refresh_time FROM instances",
            [],
        )
    }

    fn refresh_instance(&self, key: &InstanceKey, refresh_time: u64) -> Result<ServiceInstance> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE instances SET refresh_time = ?5
                 WHERE domain = ?1 AND project = ?2 AND service_id = ?3 AND instance_id = ?4",
                params![
                    key.domain_project.domain,
                    key.domain_project.project,
                    key.service_id,
                    key.instance_id,
                    refresh_time as i64
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            debug!("heartbeat for unknown instance {}", key.instance_id);
            return Err(RegistryError::InstanceNotFound(key.instance_id.clone()));
        }
        read_instance(&conn, key)
    }

    fn delete_instance(&self, key: &InstanceKey) -> Result<bool> {
        self.write(|tx, pending| match remove_instance(tx, key)? {
            Some(instance) => {
                pending.push((Action::Delete, EventPayload::Instance(instance)));
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn add_rules(&self, rules: &[Rule]) -> Result<Vec<String>> {
        self.write(|tx, pending| {
            let mut added = Vec::new();
            for rule in rules {
                let existing: Vec<Rule> = query_bodies(
                    tx,
                    "SELECT body FROM rules WHERE service_id = ?1",
                    [&rule.service_id],
                )?;
                ensure_single_rule_type(existing.iter().chain(std::iter::once(rule)))?;
                if existing
                    .iter()
                    .any(|r| r.attribute == rule.attribute && r.pattern == rule.pattern)
                {
                    debug!(
                        "skip duplicate rule {}={} of service {}",
                        rule.attribute, rule.pattern, rule.service_id
                    );
                    continue;
                }
                tx.execute(
                    "INSERT INTO rules (rule_id, service_id, attribute, pattern, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        rule.rule_id,
                        rule.service_id,
                        rule.attribute,
                        rule.pattern,
                        to_json(rule)?
                    ],
                )
                .map_err(db_err)?;
                added.push(rule.rule_id.clone());
                pending.push((Action::Create, EventPayload::Rule(rule.clone())));
            }
            Ok(added)
        })
    }

    fn get_rules(&self, service_id: &str) -> Result<Vec<Rule>> {
        query_bodies(
            &self.conn.lock(),
            "SELECT body FROM rules WHERE service_id = ?1 ORDER BY rowid",
            [service_id],
        )
    }

    fn add_dependency(&self, dependency: &Dependency) -> Result<()> {
        let body = to_json(dependency)?;
        self.write(|tx, pending| {
            tx.execute(
                "INSERT INTO dependencies (domain, project, provider_id, consumer_id, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    dependency.domain_project.domain,
                    dependency.domain_project.project,
                    dependency.provider_id,
                    dependency.consumer_id,
                    body
                ],
            )
            .map_err(db_err)?;
            pending.push((Action::Create, EventPayload::Dependency(dependency.clone())));
            Ok(())
        })
    }

    fn get_all_dependencies(&self) -> Result<Vec<Dependency>> {
        query_bodies(
            &self.conn.lock(),
            "SELECT body FROM dependencies ORDER BY rowid",
            [],
        )
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db_err)?;
        Ok(Box::new(SqliteTransaction {
            store: self,
            conn: Some(conn),
            pending: Vec::new(),
        }))
    }
}

/// Holds the connection for its lifetime. Dropped without commit, it rolls back.
struct SqliteTransaction<'a> {
    store: &'a SqliteStore,
    conn: Option<MutexGuard<'a, Connection>>,
    pending: Pending,
}

impl SqliteTransaction<'_> {
    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_deref()
            .ok_or_else(|| RegistryError::Internal("transaction already finished".into()))
    }
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn get_instance(&mut self, key: &InstanceKey) -> Result<ServiceInstance> {
        read_instance(self.conn()?, key)
    }

    fn delete_instance(&mut self, key: &InstanceKey) -> Result<bool> {
        match remove_instance(self.conn()?, key)? {
            Some(instance) => {
                self.pending
                    .push((Action::Delete, EventPayload::Instance(instance)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Err(RegistryError::Internal("transaction already finished".into()));
        };
        let pending = std::mem::take(&mut self.pending);
        let stamped = match stamp(&conn, pending) {
            Ok(stamped) => stamped,
            Err(e) => {
                rollback(&conn);
                return Err(db_err(e));
            }
        };
        if let Err(e) = conn.execute_batch("COMMIT") {
            rollback(&conn);
            return Err(db_err(e));
        }
        self.store.emit(stamped);
        drop(conn);
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.execute_batch("ROLLBACK").map_err(db_err)?;
        }
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            rollback(&conn);
        }
    }
}

fn rollback(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        warn!("rollback failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::{DomainProject, HealthCheck, RuleType};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeListener for Recorder {
        fn on_change(&self, event: ChangeEvent) {
            self.events.lock().push(event);
        }
    }

    fn store_with_recorder() -> (SqliteStore, Arc<Recorder>) {
        let store = SqliteStore::open_in_memory().unwrap();
        let recorder = Arc::new(Recorder::default());
        store.set_listener(recorder.clone());
        (store, recorder)
    }

    fn instance(service_id: &str, refresh_time: u64) -> ServiceInstance {
        let mut inst = ServiceInstance::new(
            DomainProject::default(),
            service_id,
            "host-1",
            vec!["rest://10.0.0.1:8080".into()],
            refresh_time,
        );
        inst.health_check = HealthCheck::heartbeat(5, 2);
        inst
    }

    #[test]
    fn test_service_round_trip_and_not_found() {
        let (store, recorder) = store_with_recorder();
        let mut svc = Service::new(DomainProject::new("acme", "shop"), "shop", "cart", "1.0.0");
        svc.add_tag("region", "eu");
        store.add_service(&svc).unwrap();

        assert_eq!(store.get_service(&svc.service_id).unwrap(), svc);
        assert_eq!(store.get_all_services().unwrap().len(), 1);
        assert!(store.get_service("nope").unwrap_err().is_not_found());

        store.add_service(&svc).unwrap();
        let actions: Vec<Action> = recorder.events.lock().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![Action::Create, Action::Update]);
    }

    #[test]
    fn test_refresh_and_idempotent_delete() {
        let (store, recorder) = store_with_recorder();
        let inst = instance("svc", 1_000);
        store.add_instance(&inst).unwrap();

        let refreshed = store.refresh_instance(&inst.key(), 5_000).unwrap();
        assert_eq!(refreshed.refresh_time, 5_000);
        assert_eq!(store.get_instance(&inst.key()).unwrap().refresh_time, 5_000);
        assert_eq!(store.get_instances("svc").unwrap().len(), 1);

        assert!(store.delete_instance(&inst.key()).unwrap());
        assert!(!store.delete_instance(&inst.key()).unwrap());
        assert!(store
            .refresh_instance(&inst.key(), 6_000)
            .unwrap_err()
            .is_not_found());

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action, Action::Delete);
        assert!(events[1].revision > events[0].revision);
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let (store, recorder) = store_with_recorder();
        let inst = instance("svc", 1_000);
        store.add_instance(&inst).unwrap();

        {
            let mut txn = store.begin().unwrap();
            assert!(txn.delete_instance(&inst.key()).unwrap());
            assert!(txn.get_instance(&inst.key()).unwrap_err().is_not_found());
            // dropped without commit
        }
        assert!(store.get_instance(&inst.key()).is_ok());

        let mut txn = store.begin().unwrap();
        txn.delete_instance(&inst.key()).unwrap();
        txn.abort().unwrap();
        assert!(store.get_instance(&inst.key()).is_ok());
        assert_eq!(recorder.events.lock().len(), 1);

        let mut txn = store.begin().unwrap();
        txn.delete_instance(&inst.key()).unwrap();
        txn.commit().unwrap();
        assert!(store.get_instance(&inst.key()).unwrap_err().is_not_found());

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action, Action::Delete);
    }

    #[test]
    fn test_rules_reject_mixed_types_and_skip_duplicates() {
        let (store, _) = store_with_recorder();
        let dp = DomainProject::default();
        let white = Rule::new(dp.clone(), "p", RuleType::White, "AppId", "shop");
        let ids = store
            .add_rules(&[white.clone(), Rule::new(dp.clone(), "p", RuleType::White, "AppId", "shop")])
            .unwrap();
        assert_eq!(ids, vec![white.rule_id.clone()]);

        let err = store
            .add_rules(&[Rule::new(dp.clone(), "p", RuleType::Black, "Version", "1.*")])
            .unwrap_err();
        assert_eq!(err, RegistryError::MixedRuleType);

        // another provider is unaffected
        store
            .add_rules(&[Rule::new(dp, "q", RuleType::Black, "Version", "1.*")])
            .unwrap();
        assert_eq!(store.get_rules("p").unwrap(), vec![white]);
    }

    #[test]
    fn test_concurrent_writers_emit_in_revision_order() {
        let (store, recorder) = store_with_recorder();
        let store = Arc::new(store);
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 0..100 {
                        store.add_instance(&instance("svc", n)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let revisions: Vec<i64> = recorder.events.lock().iter().map(|e| e.revision).collect();
        assert_eq!(revisions.len(), 800);
        assert_eq!(revisions, (1..=800).collect::<Vec<_>>());
        assert_eq!(store.revision().unwrap(), 800);
    }

    #[test]
    fn test_dependencies_and_revision_survive_reopen() {
        let path = std::env::temp_dir().join(format!("lodestone-{}.db", uuid::Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .add_dependency(&Dependency {
                    domain_project: DomainProject::default(),
                    provider_id: "p".into(),
                    consumer_id: "c".into(),
                })
                .unwrap();
            store.add_instance(&instance("p", 10)).unwrap();
            assert_eq!(store.revision().unwrap(), 2);
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.revision().unwrap(), 2);
        assert_eq!(store.get_all_dependencies().unwrap().len(), 1);
        assert_eq!(store.get_all_instances().unwrap()[0].refresh_time, 10);
        drop(store);
        let _ = std::fs::remove_file(&path);
    }
}
