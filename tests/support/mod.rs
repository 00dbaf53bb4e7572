//! Shared fixtures for the integration suite: a scripted portal, an
//! in-memory record store, and a fully wired service stack.
//!
//! Each test binary compiles its own copy of this module and uses a
//! subset of it, hence the blanket dead-code allowance.
#![allow(dead_code)]

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use ateneo::application::records::RecordsService;
use ateneo::application::repos::{
    CredentialError, CredentialSource, PersistedRecord, RecordsRepo, RepoError, UpsertEntry,
    UpsertOutcome,
};
use ateneo::application::reservations::ReservationService;
use ateneo::application::sync::{SessionService, SyncService};
use ateneo::cache::{
    CacheConfig, Invalidator, KvCache, MemoryKv, SnapshotCache, spawn_delete_consumer,
};
use ateneo::config::{BrokerSettings, PortalSettings, RetrySettings, SessionPoolSettings};
use ateneo::domain::identity::{Identity, Secret, SubjectId};
use ateneo::domain::types::Scope;
use ateneo::infra::queue::{DelayQueue, InMemoryBroker};
use ateneo::portal::PortalGateway;
use ateneo::portal::acquirer::SessionAcquirer;
use ateneo::portal::http::{PortalHttp, PortalResponse, TransportError};
use ateneo::portal::sessions::SessionPool;

/// The one account the wired credential source knows.
pub const SUBJECT: &str = "20230114";

pub const LOGIN_PAGE: &str = concat!(
    r#"<html><body><form method="post" action="/cas/login">"#,
    r#"<input type="hidden" name="lt" value="LT-7-xyz"/>"#,
    r#"<input type="hidden" name="execution" value="e2s1"/>"#,
    r#"<input type="text" name="username"/>"#,
    r#"<input type="password" name="password"/>"#,
    "</form></body></html>",
);

/// Three timetable blocks; the second was shortlisted but never
/// confirmed and must not survive extraction.
pub const TIMETABLE_PAGE: &str = r#"
    <html><body>
    <table id="course-table">
      <tr><th>Name</th><th>Day</th><th>Periods</th><th>Weeks</th><th>Teacher</th><th>Room</th><th>Credit</th></tr>
      <tr class="course-row" data-selected="1">
        <td>Operating Systems</td><td>Monday</td><td>period 1~2</td><td>1-16</td>
        <td>Dr. Hoare</td><td>E-204</td><td>4</td>
      </tr>
      <tr class="course-row" data-selected="0">
        <td>Shortlisted Elective</td><td>Wednesday</td><td>period 3~4</td><td>1-8</td>
        <td>Dr. Karp</td><td>B-112</td><td>2</td>
      </tr>
      <tr class="course-row" data-selected="1">
        <td>Databases</td><td>Thursday</td><td>period 7~8</td><td>2-16(even)</td>
        <td>Dr. Codd</td><td>D-117</td><td>3</td>
      </tr>
    </table>
    </body></html>
"#;

pub const SEATS_EMPTY_JSON: &str = r#"{"data": []}"#;

pub const HISTORY_JSON: &str = r#"{"entries": [
    {"action": "reserve", "target": "seat E3-41", "time": "2025-03-01T10:00:00"},
    {"action": "cancel", "target": "seat E3-41", "time": "2025-03-01T18:30:00"}
]}"#;

/// Scripted portal backend.
///
/// Serves the login handshake and every record endpoint from canned
/// bodies, counts arrivals per endpoint, and honors only the most
/// recently issued session cookie so expiry can be forced mid-test.
pub struct FakePortal {
    counts: Mutex<HashMap<String, usize>>,
    outage: AtomicBool,
    reject_login: AtomicBool,
    accept_reservations: AtomicBool,
    fetch_latency: Mutex<Duration>,
    session_serial: AtomicUsize,
    timetable: Mutex<String>,
    history: Mutex<String>,
}

impl FakePortal {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            outage: AtomicBool::new(false),
            reject_login: AtomicBool::new(false),
            accept_reservations: AtomicBool::new(true),
            fetch_latency: Mutex::new(Duration::ZERO),
            session_serial: AtomicUsize::new(0),
            timetable: Mutex::new(TIMETABLE_PAGE.to_string()),
            history: Mutex::new(HISTORY_JSON.to_string()),
        }
    }

    /// How many requests reached the given endpoint leaf (`"timetable"`,
    /// `"login_post"`, ...).
    pub fn count(&self, leaf: &str) -> usize {
        self.counts.lock().unwrap().get(leaf).copied().unwrap_or(0)
    }

    /// Makes every request fail with a timeout until switched back.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn set_reject_login(&self, reject: bool) {
        self.reject_login.store(reject, Ordering::SeqCst);
    }

    pub fn set_accept_reservations(&self, accept: bool) {
        self.accept_reservations.store(accept, Ordering::SeqCst);
    }

    /// Slows record fetches down so concurrent readers overlap.
    pub fn set_fetch_latency(&self, latency: Duration) {
        *self.fetch_latency.lock().unwrap() = latency;
    }

    pub fn set_history(&self, body: &str) {
        *self.history.lock().unwrap() = body.to_string();
    }

    pub fn set_timetable(&self, body: &str) {
        *self.timetable.lock().unwrap() = body.to_string();
    }

    /// Invalidates every cookie issued so far; the next login mints a
    /// fresh one that is honored again.
    pub fn expire_sessions(&self) {
        self.session_serial.fetch_add(1, Ordering::SeqCst);
    }

    fn bump(&self, leaf: &str) {
        *self.counts.lock().unwrap().entry(leaf.to_string()).or_insert(0) += 1;
    }

    fn authorized(&self, cookie: Option<&str>) -> bool {
        let serial = self.session_serial.load(Ordering::SeqCst);
        serial > 0
            && cookie.is_some_and(|header| header.contains(&format!("portal_session=s{serial}")))
    }
}

impl Default for FakePortal {
    fn default() -> Self {
        Self::new()
    }
}

fn leaf_of(url: &Url) -> String {
    let path = url.path();
    if path.contains("/cas/login") {
        "login".to_string()
    } else {
        path.rsplit('/').next().unwrap_or("").to_string()
    }
}

fn respond(status: u16, body: &str, cookies: Vec<(&str, &str)>) -> PortalResponse {
    PortalResponse {
        status,
        body: body.to_string(),
        cookies: cookies
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    }
}

#[async_trait]
impl PortalHttp for FakePortal {
    async fn get(&self, url: &Url, cookie: Option<&str>) -> Result<PortalResponse, TransportError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout);
        }
        let leaf = leaf_of(url);
        self.bump(&leaf);
        if leaf == "login" {
            return Ok(respond(200, LOGIN_PAGE, vec![("JSESSIONID", "node7~i")]));
        }

        let latency = *self.fetch_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        // An unrecognized session gets the login form, like the real
        // portal, which the gateway reads as an expired session.
        if !self.authorized(cookie) {
            return Ok(respond(200, LOGIN_PAGE, vec![]));
        }

        let body = match leaf.as_str() {
            "timetable" => self.timetable.lock().unwrap().clone(),
            "seats.json" => SEATS_EMPTY_JSON.to_string(),
            "reservations.json" => r#"{"records": []}"#.to_string(),
            "credits.json" => r#"{"items": []}"#.to_string(),
            "history.json" => self.history.lock().unwrap().clone(),
            _ => return Ok(respond(404, "not found", vec![])),
        };
        Ok(respond(200, &body, vec![]))
    }

    async fn post_form(
        &self,
        url: &Url,
        _form: &[(String, String)],
        cookie: Option<&str>,
    ) -> Result<PortalResponse, TransportError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout);
        }
        if url.path().contains("/cas/login") {
            self.bump("login_post");
            if self.reject_login.load(Ordering::SeqCst) {
                return Ok(respond(
                    200,
                    "<p>Incorrect username or password</p>",
                    vec![],
                ));
            }
            let serial = self.session_serial.fetch_add(1, Ordering::SeqCst) + 1;
            let session = format!("s{serial}");
            return Ok(respond(302, "", vec![("portal_session", &session)]));
        }

        let leaf = leaf_of(url);
        self.bump(&leaf);
        if !self.authorized(cookie) {
            return Ok(respond(200, LOGIN_PAGE, vec![]));
        }
        match leaf.as_str() {
            "reserve.json" => {
                if self.accept_reservations.load(Ordering::SeqCst) {
                    Ok(respond(
                        200,
                        r#"{"success": true, "reference": "R-77", "message": "confirmed"}"#,
                        vec![],
                    ))
                } else {
                    Ok(respond(
                        200,
                        r#"{"success": false, "message": "slot taken"}"#,
                        vec![],
                    ))
                }
            }
            "cancel.json" => Ok(respond(
                200,
                r#"{"success": true, "reference": "R-77", "message": "released"}"#,
                vec![],
            )),
            _ => Ok(respond(404, "not found", vec![])),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredRelation {
    pub subject: String,
    pub scope: String,
    pub fact_key: String,
    pub manual: bool,
    pub note: Option<String>,
    pub credit: Option<f64>,
    pub recycled: bool,
}

/// In-memory stand-in for the Postgres repository, mirroring its
/// fact/relation split and conflict behavior.
#[derive(Default)]
pub struct MemoryRepo {
    facts: Mutex<HashMap<String, serde_json::Value>>,
    relations: Mutex<Vec<StoredRelation>>,
    fail_lists: AtomicBool,
}

impl MemoryRepo {
    pub fn fact_count(&self) -> usize {
        self.facts.lock().unwrap().len()
    }

    /// Live (non-recycled) relations for one subject and scope segment.
    pub fn relation_count(&self, subject: &str, segment: &str) -> usize {
        self.relations
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.subject == subject && r.scope == segment && !r.recycled)
            .count()
    }

    /// Makes every read fail so the cache-soft paths can be exercised.
    pub fn set_fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    fn apply(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        entries: &[UpsertEntry],
        update_on_conflict: bool,
    ) -> UpsertOutcome {
        let mut facts = self.facts.lock().unwrap();
        let mut relations = self.relations.lock().unwrap();
        let segment = scope.segment();
        let mut outcome = UpsertOutcome::default();

        for entry in entries {
            let fact_key = entry.record.natural_key();
            if !facts.contains_key(&fact_key) {
                let body = serde_json::to_value(&entry.record).expect("record serializes");
                facts.insert(fact_key.clone(), body);
                outcome.facts_inserted += 1;
            }

            let existing = relations.iter_mut().find(|r| {
                r.subject == subject.as_str()
                    && r.fact_key == fact_key
                    && r.scope == segment
                    && r.manual == entry.manual
            });
            match existing {
                Some(relation) if update_on_conflict => {
                    relation.note = entry.note.clone();
                    relation.credit = entry.credit;
                    relation.recycled = false;
                    outcome.relations_updated += 1;
                }
                Some(_) => {}
                None => {
                    relations.push(StoredRelation {
                        subject: subject.to_string(),
                        scope: segment.clone(),
                        fact_key,
                        manual: entry.manual,
                        note: entry.note.clone(),
                        credit: entry.credit,
                        recycled: false,
                    });
                    outcome.relations_inserted += 1;
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl RecordsRepo for MemoryRepo {
    async fn upsert(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        entries: &[UpsertEntry],
    ) -> Result<UpsertOutcome, RepoError> {
        Ok(self.apply(subject, scope, entries, true))
    }

    async fn replace_scope(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        entries: &[UpsertEntry],
    ) -> Result<UpsertOutcome, RepoError> {
        let segment = scope.segment();
        self.relations.lock().unwrap().retain(|r| {
            !(r.subject == subject.as_str() && r.scope == segment && !r.manual)
        });
        Ok(self.apply(subject, scope, entries, false))
    }

    async fn list_scope(
        &self,
        subject: &SubjectId,
        scope: &Scope,
    ) -> Result<Vec<PersistedRecord>, RepoError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(RepoError::from_persistence("store offline for maintenance"));
        }
        let facts = self.facts.lock().unwrap();
        let segment = scope.segment();
        Ok(self
            .relations
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.subject == subject.as_str() && r.scope == segment && !r.recycled)
            .map(|r| {
                let body = facts.get(&r.fact_key).expect("relation points at a fact");
                PersistedRecord {
                    record: serde_json::from_value(body.clone()).expect("fact body decodes"),
                    fact_key: r.fact_key.clone(),
                    manual: r.manual,
                    note: r.note.clone(),
                    credit: r.credit,
                }
            })
            .collect())
    }

    async fn recycle(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        fact_key: &str,
    ) -> Result<(), RepoError> {
        let segment = scope.segment();
        let mut relations = self.relations.lock().unwrap();
        let target = relations.iter_mut().find(|r| {
            r.subject == subject.as_str()
                && r.scope == segment
                && r.fact_key == fact_key
                && !r.recycled
        });
        match target {
            Some(relation) => {
                relation.recycled = true;
                Ok(())
            }
            None => Err(RepoError::NotFound),
        }
    }
}

pub struct FixedCredentials;

#[async_trait]
impl CredentialSource for FixedCredentials {
    async fn credentials(&self, _subject: &SubjectId) -> Result<Identity, CredentialError> {
        Ok(Identity::new(SUBJECT, Secret::new("hunter2")))
    }
}

pub fn subject() -> SubjectId {
    SubjectId::new(SUBJECT)
}

pub fn portal_settings() -> PortalSettings {
    PortalSettings {
        base_url: Url::parse("https://portal.example.edu").unwrap(),
        login_path: "/cas/login".to_string(),
        failure_phrase: "Incorrect username or password".to_string(),
        affinity_cookie: "JSESSIONID".to_string(),
        handshake_fields: vec!["lt".to_string(), "execution".to_string()],
        user_agent: "test-agent".to_string(),
        request_timeout: Duration::from_secs(5),
        pipeline_timeout: Duration::from_secs(30),
        student_root: "/student".to_string(),
        staff_root: "/staff".to_string(),
        account: None,
        secret: None,
    }
}

/// Millisecond-scale delay pipeline so trailing deletes land within a
/// test's patience.
pub fn broker_settings() -> BrokerSettings {
    BrokerSettings {
        delay: Duration::from_millis(60),
        drop_multiple: NonZeroU32::new(20).unwrap(),
        poll_interval: Duration::from_millis(10),
        visibility_timeout: Duration::from_millis(40),
    }
}

/// The full application stack over scripted fakes. Background tasks
/// (delay forwarder, trailing-delete consumer) run on the test runtime
/// and die with it.
pub struct Harness {
    pub records: RecordsService,
    pub reservations: ReservationService,
    pub repo: Arc<MemoryRepo>,
    pub portal: Arc<FakePortal>,
    pub kv: Arc<dyn KvCache>,
}

pub async fn harness() -> Harness {
    let portal = Arc::new(FakePortal::new());
    let http: Arc<dyn PortalHttp> = portal.clone();
    let settings = portal_settings();
    let retry = RetrySettings {
        attempts: NonZeroU32::new(3).unwrap(),
        backoff_unit: Duration::from_millis(1),
    };

    let cache_config = CacheConfig::default();
    let kv: Arc<dyn KvCache> = Arc::new(MemoryKv::new(&cache_config));
    let snapshots = Arc::new(SnapshotCache::new(kv.clone(), cache_config));

    let broker = Arc::new(InMemoryBroker::new());
    let defer = DelayQueue::new(broker, broker_settings())
        .await
        .expect("delay queue");
    defer.spawn_forwarder();
    spawn_delete_consumer(&defer, kv.clone())
        .await
        .expect("delete consumer");
    let invalidator = Invalidator::new(kv.clone(), defer);

    let repo = Arc::new(MemoryRepo::default());
    let pool = Arc::new(SessionPool::new(&SessionPoolSettings {
        capacity: NonZeroU32::new(8).unwrap(),
        entry_ttl: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(300),
    }));
    let acquirer = Arc::new(SessionAcquirer::new(
        http.clone(),
        settings.clone(),
        retry.clone(),
    ));
    let sessions = Arc::new(SessionService::new(
        Arc::new(FixedCredentials),
        pool,
        acquirer,
    ));
    let gateway = Arc::new(PortalGateway::new(http, settings));
    let sync = Arc::new(SyncService::new(
        sessions.clone(),
        gateway.clone(),
        repo.clone(),
        retry,
        Duration::from_secs(5),
    ));

    let records = RecordsService::new(repo.clone(), snapshots, invalidator.clone(), sync);
    let reservations = ReservationService::new(sessions, gateway, invalidator);

    Harness {
        records,
        reservations,
        repo,
        portal,
        kv,
    }
}
