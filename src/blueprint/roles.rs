//! Static service role tables.
//!
//! Each project kind has a fixed table of roles. Optional roles carry the
//! feature flag that turns them on.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::RetryConfig;
use crate::project::{Feature, Project, ProjectKind};

/// Service role names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleName {
    /// The project's own application container
    App,
    /// Database server
    Db,
    /// Redis cache
    Cache,
    /// SMTP mail catcher
    Mail,
}

impl RoleName {
    /// All role names in declaration order.
    pub const ALL: [RoleName; 4] = [Self::App, Self::Db, Self::Cache, Self::Mail];

    /// Role identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Db => "db",
            Self::Cache => "cache",
            Self::Mail => "mail",
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown role '{s}'"))
    }
}

/// How readiness of a started instance is probed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "test", rename_all = "lowercase")]
pub enum Probe {
    /// The container is running
    Running,
    /// The engine runs this command inside the container and reports health
    Command(Vec<String>),
    /// A TCP connection to the published host port succeeds
    Tcp,
}

/// Health-check contract for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Probe type
    pub probe: Probe,

    /// Delay between probes in milliseconds
    pub interval_ms: u64,

    /// Timeout of a single probe in milliseconds
    pub timeout_ms: u64,

    /// Probes attempted before giving up
    pub retries: u32,
}

impl HealthCheck {
    /// Create a health check with the given probe and default timings.
    pub fn new(probe: Probe) -> Self {
        Self { probe, interval_ms: 1_000, timeout_ms: 5_000, retries: 30 }
    }

    /// Set the probe interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the number of probes.
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Probe interval.
    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Single probe timeout.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Bounded backoff schedule for waiting on this check.
    ///
    /// The first probe runs immediately; later probes back off from the
    /// interval up to four times the interval.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retries.saturating_sub(1),
            initial_delay: self.interval_duration(),
            max_delay: self.interval_duration() * 4,
            backoff_multiplier: 1.5,
            jitter: false,
            attempt_timeout: Some(self.timeout_duration()),
        }
    }
}

/// Where a volume mount comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeSource {
    /// Engine-managed volume, scoped to the stack by the synthesizer
    Named(String),
    /// Path relative to the project directory, bind mounted
    Project(PathBuf),
}

/// A volume mount declared by a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Source of the mount
    pub source: VolumeSource,

    /// Mount point inside the container
    pub target: String,

    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    fn named(name: &str, target: &str) -> Self {
        Self { source: VolumeSource::Named(name.to_string()), target: target.to_string(), read_only: false }
    }

    fn project(target: &str, read_only: bool) -> Self {
        Self { source: VolumeSource::Project(PathBuf::from(".")), target: target.to_string(), read_only }
    }
}

/// A service role with its defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRole {
    /// Role name
    pub name: RoleName,

    /// Image reference
    pub image: String,

    /// Port the service listens on inside the container
    pub container_port: u16,

    /// Requested host port
    pub host_port: u16,

    /// Volume mounts
    pub volumes: Vec<VolumeMount>,

    /// Default environment (values may contain `${VAR}` and `${service:role}`)
    pub env: BTreeMap<String, String>,

    /// Environment injected into roles that depend on this one
    pub link_env: BTreeMap<String, String>,

    /// Roles that must be present and started first
    pub requires: Vec<RoleName>,

    /// Roles started first when present
    pub after: Vec<RoleName>,

    /// Command override
    pub command: Option<Vec<String>>,

    /// Working directory inside the container
    pub workdir: Option<String>,

    /// Readiness probe
    pub healthcheck: HealthCheck,

    /// Feature that enables an optional role; `None` means always present
    pub trigger: Option<Feature>,
}

impl ServiceRole {
    /// Whether the role is part of every blueprint for its kind.
    pub fn is_required(&self) -> bool {
        self.trigger.is_none()
    }

    /// Every role this one depends on.
    pub fn dependencies(&self) -> impl Iterator<Item = RoleName> + '_ {
        self.requires.iter().chain(self.after.iter()).copied()
    }
}

/// Build the role table for a project.
///
/// Roles are returned in declaration order, which is also the synthesizer's
/// tie-break order.
pub fn role_table(project: &Project) -> Vec<ServiceRole> {
    match project.kind {
        ProjectKind::Php => vec![
            php_app(project),
            database(project, DbFlavor::Php),
            cache(DbFlavor::Php),
            mail(DbFlavor::Php),
        ],
        ProjectKind::Python => vec![
            python_app(project),
            database(project, DbFlavor::Python),
            cache(DbFlavor::Python),
            mail(DbFlavor::Python),
        ],
        ProjectKind::Unknown => vec![static_app()],
    }
}

/// Which naming convention the application expects for connection env.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbFlavor {
    Php,
    Python,
}

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
}

fn command(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn app_base(image: &str, container_port: u16, host_port: u16) -> ServiceRole {
    ServiceRole {
        name: RoleName::App,
        image: image.to_string(),
        container_port,
        host_port,
        volumes: Vec::new(),
        env: BTreeMap::new(),
        link_env: BTreeMap::new(),
        requires: Vec::new(),
        after: vec![RoleName::Db, RoleName::Cache, RoleName::Mail],
        command: None,
        workdir: None,
        healthcheck: HealthCheck::new(Probe::Running).retries(10),
        trigger: None,
    }
}

fn php_app(project: &Project) -> ServiceRole {
    let mut role = app_base("php:8.2-apache", 80, 8080);
    role.volumes.push(VolumeMount::project("/var/www/html", false));
    role.workdir = Some("/var/www/html".to_string());
    role.env = env(&[("APP_ENV", "local")]);

    if project.has(Feature::Laravel) || project.has(Feature::Symfony) {
        role.env.insert("APACHE_DOCUMENT_ROOT".to_string(), "/var/www/html/public".to_string());
    }
    role
}

fn python_app(project: &Project) -> ServiceRole {
    let mut role = app_base("python:3.12-slim", 8000, 8000);
    role.volumes.push(VolumeMount::project("/app", false));
    role.workdir = Some("/app".to_string());
    role.env = env(&[("PYTHONUNBUFFERED", "1")]);

    let install = "if [ -f requirements.txt ]; then pip install -r requirements.txt; fi";
    let serve = if project.has(Feature::Django) {
        Some("python manage.py runserver 0.0.0.0:8000")
    } else if project.has(Feature::Flask) {
        Some("flask run --host 0.0.0.0 --port 8000")
    } else {
        None
    };

    role.command = Some(match serve {
        Some(serve) => vec!["sh".to_string(), "-c".to_string(), format!("{install} && {serve}")],
        None => command(&["python", "-m", "http.server", "8000"]),
    });
    role
}

fn static_app() -> ServiceRole {
    let mut role = app_base("nginx:alpine", 80, 8080);
    role.volumes.push(VolumeMount::project("/usr/share/nginx/html", true));
    role.after.clear();
    role
}

fn database(project: &Project, flavor: DbFlavor) -> ServiceRole {
    let mysql = project.has(Feature::DbMysql);

    let (image, port, data_dir, service_env, probe) = if mysql {
        (
            "mysql:8.0",
            3306,
            "/var/lib/mysql",
            env(&[
                ("MYSQL_DATABASE", "${DB_DATABASE:-app}"),
                ("MYSQL_USER", "${DB_USERNAME:-app}"),
                ("MYSQL_PASSWORD", "${DB_PASSWORD:-secret}"),
                ("MYSQL_ROOT_PASSWORD", "${DB_ROOT_PASSWORD:-root}"),
            ]),
            command(&["mysqladmin", "ping", "-h", "127.0.0.1", "--silent"]),
        )
    } else {
        (
            "postgres:16-alpine",
            5432,
            "/var/lib/postgresql/data",
            env(&[
                ("POSTGRES_DB", "${DB_DATABASE:-app}"),
                ("POSTGRES_USER", "${DB_USERNAME:-app}"),
                ("POSTGRES_PASSWORD", "${DB_PASSWORD:-secret}"),
            ]),
            command(&["pg_isready", "-h", "127.0.0.1"]),
        )
    };

    let port_str = port.to_string();
    let mut link_env = env(&[
        ("DB_HOST", "${service:db}"),
        ("DB_PORT", &port_str),
        ("DB_DATABASE", "${DB_DATABASE:-app}"),
        ("DB_USERNAME", "${DB_USERNAME:-app}"),
        ("DB_PASSWORD", "${DB_PASSWORD:-secret}"),
    ]);
    match flavor {
        DbFlavor::Php => {
            link_env.insert("DB_CONNECTION".to_string(), if mysql { "mysql" } else { "pgsql" }.to_string());
        }
        DbFlavor::Python => {
            let scheme = if mysql { "mysql" } else { "postgres" };
            link_env.insert(
                "DATABASE_URL".to_string(),
                format!(
                    "{scheme}://${{DB_USERNAME:-app}}:${{DB_PASSWORD:-secret}}@${{service:db}}:{port}/${{DB_DATABASE:-app}}"
                ),
            );
        }
    }

    ServiceRole {
        name: RoleName::Db,
        image: image.to_string(),
        container_port: port,
        host_port: port,
        volumes: vec![VolumeMount::named("data", data_dir)],
        env: service_env,
        link_env,
        requires: Vec::new(),
        after: Vec::new(),
        command: None,
        workdir: None,
        healthcheck: HealthCheck::new(Probe::Command(probe)).interval(Duration::from_secs(2)),
        trigger: Some(Feature::HasDatabase),
    }
}

fn cache(flavor: DbFlavor) -> ServiceRole {
    let link_env = match flavor {
        DbFlavor::Php => env(&[("REDIS_HOST", "${service:cache}"), ("REDIS_PORT", "6379")]),
        DbFlavor::Python => env(&[
            ("REDIS_HOST", "${service:cache}"),
            ("REDIS_PORT", "6379"),
            ("REDIS_URL", "redis://${service:cache}:6379/0"),
        ]),
    };

    ServiceRole {
        name: RoleName::Cache,
        image: "redis:7-alpine".to_string(),
        container_port: 6379,
        host_port: 6379,
        volumes: vec![VolumeMount::named("data", "/data")],
        env: BTreeMap::new(),
        link_env,
        requires: Vec::new(),
        after: Vec::new(),
        command: None,
        workdir: None,
        healthcheck: HealthCheck::new(Probe::Command(command(&["redis-cli", "ping"]))),
        trigger: Some(Feature::HasRedis),
    }
}

fn mail(flavor: DbFlavor) -> ServiceRole {
    let link_env = match flavor {
        DbFlavor::Php => env(&[
            ("MAIL_MAILER", "smtp"),
            ("MAIL_HOST", "${service:mail}"),
            ("MAIL_PORT", "1025"),
        ]),
        DbFlavor::Python => env(&[("EMAIL_HOST", "${service:mail}"), ("EMAIL_PORT", "1025")]),
    };

    ServiceRole {
        name: RoleName::Mail,
        image: "axllent/mailpit:latest".to_string(),
        container_port: 8025,
        host_port: 8025,
        volumes: Vec::new(),
        env: BTreeMap::new(),
        link_env,
        requires: Vec::new(),
        after: Vec::new(),
        command: None,
        workdir: None,
        healthcheck: HealthCheck::new(Probe::Running).retries(10),
        trigger: Some(Feature::HasMail),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn project(kind: ProjectKind, features: &[Feature]) -> Project {
        Project {
            path: PathBuf::from("/work/shop"),
            name: "shop".to_string(),
            kind,
            features: features.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn test_php_table_declaration_order() {
        let table = role_table(&project(ProjectKind::Php, &[]));
        let names: Vec<_> = table.iter().map(|r| r.name).collect();
        assert_eq!(names, vec![RoleName::App, RoleName::Db, RoleName::Cache, RoleName::Mail]);
        assert!(table[0].is_required());
        assert!(!table[1].is_required());
    }

    #[test]
    fn test_database_flavor_follows_driver() {
        let mysql = role_table(&project(ProjectKind::Php, &[Feature::DbMysql]));
        assert_eq!(mysql[1].image, "mysql:8.0");
        assert_eq!(mysql[1].container_port, 3306);
        assert_eq!(mysql[1].link_env["DB_CONNECTION"], "mysql");

        let pg = role_table(&project(ProjectKind::Python, &[Feature::HasDatabase]));
        assert_eq!(pg[1].image, "postgres:16-alpine");
        assert_eq!(pg[1].host_port, 5432);
        assert!(pg[1].link_env["DATABASE_URL"].starts_with("postgres://"));
        assert!(pg[1].link_env["DATABASE_URL"].contains("@${service:db}:5432/"));
    }

    #[test]
    fn test_unknown_kind_is_app_only() {
        let table = role_table(&project(ProjectKind::Unknown, &[Feature::HasRedis]));
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].name, RoleName::App);
        assert!(table[0].after.is_empty());
    }

    #[test]
    fn test_django_command() {
        let table = role_table(&project(ProjectKind::Python, &[Feature::Django]));
        let cmd = table[0].command.as_ref().unwrap();
        assert!(cmd[2].contains("manage.py runserver 0.0.0.0:8000"));
    }

    #[test]
    fn test_health_retry_config() {
        let check = HealthCheck::new(Probe::Running).interval(Duration::from_millis(200)).retries(5);
        let retry = check.retry_config();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.initial_delay, Duration::from_millis(200));
        assert_eq!(retry.max_delay, Duration::from_millis(800));
        assert!(!retry.jitter);
    }

    #[test]
    fn test_role_name_parse() {
        assert_eq!("cache".parse::<RoleName>().unwrap(), RoleName::Cache);
        assert!("queue".parse::<RoleName>().is_err());
    }
}
