use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use tagcore::config::{EngineConfig, NotifierConfig};
use tagcore::configuration::FailureClass;
use tagcore::entity::Entity;
use tagcore::persistence::{InMemoryPersistence, PersistenceAdapter, PersistenceError};
use tagcore::supervision::SupervisionEntity;
use tagcore::{
    ConfigurationElement, ConfigurationEngine, EntityCache, EntityId, EntityKind, SupervisionManager,
    SupervisionNotifier, SupervisionStatus,
};

/// Widens the window between reading an entity and writing it back.
struct SlowPersistence {
    inner: InMemoryPersistence,
    delay: Duration,
}

impl PersistenceAdapter for SlowPersistence {
    fn load_all(&self, kind: EntityKind) -> Result<Vec<Entity>, PersistenceError> {
        self.inner.load_all(kind)
    }

    fn insert(&self, entity: &Entity) -> Result<(), PersistenceError> {
        self.inner.insert(entity)
    }

    fn update(&self, entity: &Entity, changed_fields: &[String]) -> Result<(), PersistenceError> {
        thread::sleep(self.delay);
        self.inner.update(entity, changed_fields)
    }

    fn delete(&self, kind: EntityKind, id: EntityId) -> Result<(), PersistenceError> {
        self.inner.delete(kind, id)
    }
}

fn slow_engine() -> (Arc<ConfigurationEngine>, Arc<SlowPersistence>) {
    slow_engine_with(Duration::from_millis(1), EngineConfig::default())
}

fn slow_engine_with(delay: Duration, config: EngineConfig) -> (Arc<ConfigurationEngine>, Arc<SlowPersistence>) {
    let dao = Arc::new(SlowPersistence {
        inner: InMemoryPersistence::new(),
        delay,
    });
    let cache = Arc::new(EntityCache::default());
    let engine = ConfigurationEngine::new(cache, dao.clone(), config);
    (Arc::new(engine), dao)
}

fn data_tag(raw: u64) -> ConfigurationElement {
    ConfigurationElement::create(EntityKind::DataTag, raw).with("name", format!("tag.{raw}"))
}

#[test]
fn concurrent_updates_of_one_tag_never_interleave() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 20;

    let (engine, dao) = slow_engine();
    assert!(engine.apply(&data_tag(1)).is_ok());

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for round in 0..ROUNDS {
                    let stamp = format!("writer-{t}-{round}");
                    let element = ConfigurationElement::update(EntityKind::DataTag, 1)
                        .with("name", stamp.clone())
                        .with("description", stamp);
                    let report = engine.apply(&element);
                    assert!(report.is_ok(), "{report}");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let cached = engine.cache().tags().get(EntityId::new(1)).unwrap();
    let common = cached.common();
    assert_eq!(common.description.as_deref(), Some(common.name.as_str()));

    let Some(Entity::DataTag(persisted)) = dao.inner.get(EntityKind::DataTag, EntityId::new(1)) else {
        panic!("tag row missing");
    };
    assert_eq!(persisted.common.name, common.name);
    assert!(!engine.cache().tags().is_write_locked(EntityId::new(1)));
}

#[test]
fn concurrent_rule_creates_all_register_on_shared_input() {
    const RULES: u64 = 8;

    let (engine, _dao) = slow_engine();
    assert!(engine.apply(&data_tag(1)).is_ok());

    let barrier = Arc::new(Barrier::new(RULES as usize));
    let handles: Vec<_> = (0..RULES)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let element = ConfigurationElement::create(EntityKind::RuleTag, 100 + i)
                    .with("name", format!("rule.{i}"))
                    .with("ruleText", "#1 > 0");
                assert!(engine.apply(&element).is_ok());
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let tag = engine.cache().tags().get(EntityId::new(1)).unwrap();
    assert_eq!(tag.rule_ids().len(), RULES as usize);
    assert!(engine.graph().verify().is_empty());
}

#[test]
fn racing_rule_creates_and_input_removal_stay_consistent() {
    let (engine, _dao) = slow_engine();
    assert!(engine.apply(&data_tag(1)).is_ok());

    let creator = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for raw in 10..40 {
                let element = ConfigurationElement::create(EntityKind::RuleTag, raw)
                    .with("name", format!("rule.{raw}"))
                    .with("ruleText", "#1");
                // May fail once the input is gone.
                let _ = engine.apply(&element);
            }
        })
    };
    let remover = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            // May lose against a rule that registered mid-removal.
            let _ = engine.apply(&ConfigurationElement::remove(EntityKind::DataTag, 1));
        })
    };
    creator.join().unwrap();
    remover.join().unwrap();
    assert!(engine.graph().verify().is_empty());

    let report = engine.apply(&ConfigurationElement::remove(EntityKind::DataTag, 1));
    assert!(!report.is_failure(), "{report}");
    assert!(engine.cache().tags().is_empty());
    assert!(engine.graph().verify().is_empty());
}

#[test]
fn lock_timeout_is_reported_as_failure() {
    // The cache itself would wait forever; the engine config bounds it.
    let cache = Arc::new(EntityCache::default());
    let engine = ConfigurationEngine::new(
        Arc::clone(&cache),
        Arc::new(InMemoryPersistence::new()),
        EngineConfig {
            lock_timeout_ms: Some(50),
            ..EngineConfig::default()
        },
    );
    assert_eq!(cache.tags().lock_timeout(), Some(Duration::from_millis(50)));
    assert!(engine.apply(&data_tag(1)).is_ok());

    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            let _guard = cache.lock(EntityKind::DataTag, EntityId::new(1)).unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
    };
    locked_rx.recv().unwrap();

    let report = engine.apply(&ConfigurationElement::update(EntityKind::DataTag, 1).with("name", "renamed"));
    assert!(report.is_failure());
    assert_eq!(report.failure, Some(FailureClass::LockTimeout));

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    let report = engine.apply(&ConfigurationElement::update(EntityKind::DataTag, 1).with("name", "renamed"));
    assert!(report.is_ok(), "{report}");
    assert_eq!(cache.tags().get(EntityId::new(1)).unwrap().common().name, "renamed");
}

#[test]
fn crossing_rule_rewires_never_close_a_cycle() {
    let config = EngineConfig {
        lock_timeout_ms: Some(200),
        ..EngineConfig::default()
    };
    let (engine, _dao) = slow_engine_with(Duration::from_millis(50), config);
    assert!(engine.apply(&data_tag(1)).is_ok());
    for raw in [10, 20] {
        let rule = ConfigurationElement::create(EntityKind::RuleTag, raw)
            .with("name", format!("rule.{raw}"))
            .with("ruleText", "#1 > 0");
        assert!(engine.apply(&rule).is_ok());
    }

    let barrier = Arc::new(Barrier::new(2));
    let (done_tx, done_rx) = mpsc::channel();
    for (rule, input) in [(10u64, 20u64), (20, 10)] {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            barrier.wait();
            let element =
                ConfigurationElement::update(EntityKind::RuleTag, rule).with("ruleText", format!("#{input} > 0"));
            let report = engine.apply(&element);
            done_tx.send(report).unwrap();
        });
    }

    let mut succeeded = 0;
    for _ in 0..2 {
        let report = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("rewire did not finish in bounded time");
        if report.is_failure() {
            assert!(
                matches!(report.failure, Some(FailureClass::Validation | FailureClass::LockTimeout)),
                "{report}"
            );
        } else {
            succeeded += 1;
        }
    }
    assert!(succeeded <= 1);

    let inputs_of = |raw: u64| {
        let tag = engine.cache().tags().get(EntityId::new(raw)).unwrap();
        tag.as_rule().unwrap().rule_input_tag_ids.clone()
    };
    assert!(!(inputs_of(10).contains(&EntityId::new(20)) && inputs_of(20).contains(&EntityId::new(10))));
    assert!(engine.graph().verify().is_empty());
    for raw in [1, 10, 20] {
        assert!(!engine.cache().tags().is_write_locked(EntityId::new(raw)));
    }
}

#[test]
fn status_reports_survive_concurrent_reconfiguration() {
    let (engine, _dao) = slow_engine();
    assert!(engine
        .apply(&ConfigurationElement::create(EntityKind::Process, 1).with("name", "P"))
        .is_ok());

    let notifier = Arc::new(SupervisionNotifier::new(NotifierConfig::default()));
    let manager = SupervisionManager::new(Arc::clone(engine.cache()), Arc::clone(&notifier));

    let updater = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for n in 0..50 {
                let element = ConfigurationElement::update(EntityKind::Process, 1)
                    .with("description", format!("revision {n}"));
                assert!(engine.apply(&element).is_ok());
            }
        })
    };
    let reporter = thread::spawn(move || {
        let mut last = SupervisionStatus::Down;
        for n in 0..50 {
            last = if n % 2 == 0 {
                SupervisionStatus::Running
            } else {
                SupervisionStatus::Uncertain
            };
            manager
                .report_status(SupervisionEntity::Process, EntityId::new(1), last, None, Utc::now())
                .unwrap();
        }
        last
    });
    updater.join().unwrap();
    let last = reporter.join().unwrap();

    let process = engine.cache().processes().get(EntityId::new(1)).unwrap();
    assert_eq!(process.state.status, last);
    assert_eq!(process.description.as_deref(), Some("revision 49"));
    notifier.shutdown();
}
