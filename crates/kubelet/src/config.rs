//! Configuration for a Kubelet
//!
//! The best way to configure the kubelet is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`].

use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

const DEFAULT_RUNTIME_ENDPOINT: &str = "unix:///run/containerd/containerd.sock";
const DEFAULT_POD_LOGS_ROOT: &str = "/var/log/pods";
const DEFAULT_RUNTIME_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SYNC_FREQUENCY_SECS: u64 = 10;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 10;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;
const DEFAULT_TERMINATION_GRACE_PERIOD_SECS: i64 = 30;
const DEFAULT_MIN_KILL_GRACE_PERIOD_SECS: i64 = 2;

/// The configuration needed for a kubelet to run properly.
///
/// This can be configured manually in your code or if you are exposing a CLI, use the
/// [`Config::new_from_flags`] (this requires the "cli" feature to
/// be enabled).
///
/// Use [`Config::default_config`] to generate a config with all
/// of the default values set.
#[derive(Clone, Debug)]
pub struct Config {
    /// The hostname of the node
    pub hostname: String,
    /// The node's name
    pub node_name: String,
    /// Runtime endpoints, `endpoint (";" endpoint)*` where each endpoint is a bare URL or
    /// `name,workloadType,url`
    pub runtime_endpoints: String,
    /// Image endpoints in the same form; empty means reuse the runtime endpoints
    pub image_endpoints: String,
    /// Root of the pod log directories
    pub pod_logs_root: PathBuf,
    /// Bound on every call made to a runtime or image endpoint
    pub runtime_request_timeout: Duration,
    /// How often every known pod is synced even without updates
    pub sync_frequency: Duration,
    /// Whether running containers are resized in place
    pub in_place_resize_enabled: bool,
    /// Whether NICs are hot plugged into running sandboxes
    pub nic_hotplug_enabled: bool,
    /// First back-off window for crashing containers and failing pulls
    pub backoff_base: Duration,
    /// Cap of the back-off window
    pub backoff_max: Duration,
    /// Grace period used when a pod declares none
    pub default_termination_grace_period: i64,
    /// Floor of every kill grace period
    pub min_kill_grace_period: i64,
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    ///
    /// Useful for cases when you don't want to set most of the values yourself.
    pub fn default_config() -> anyhow::Result<Self> {
        let hostname = default_hostname()?;
        Ok(Config {
            node_name: sanitize_hostname(&hostname),
            hostname,
            runtime_endpoints: DEFAULT_RUNTIME_ENDPOINT.to_owned(),
            image_endpoints: String::new(),
            pod_logs_root: PathBuf::from(DEFAULT_POD_LOGS_ROOT),
            runtime_request_timeout: Duration::from_secs(DEFAULT_RUNTIME_REQUEST_TIMEOUT_SECS),
            sync_frequency: Duration::from_secs(DEFAULT_SYNC_FREQUENCY_SECS),
            in_place_resize_enabled: true,
            nic_hotplug_enabled: true,
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
            default_termination_grace_period: DEFAULT_TERMINATION_GRACE_PERIOD_SECS,
            min_kill_grace_period: DEFAULT_MIN_KILL_GRACE_PERIOD_SECS,
        })
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> anyhow::Result<Self> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Self::from_opts(opts)
    }

    #[cfg(any(feature = "cli", feature = "docs"))]
    fn from_opts(opts: Opts) -> anyhow::Result<Self> {
        let hostname = match opts.hostname {
            Some(h) => h,
            None => default_hostname()?,
        };
        let node_name = opts
            .node_name
            .unwrap_or_else(|| sanitize_hostname(&hostname));
        Ok(Config {
            node_name,
            hostname,
            runtime_endpoints: opts.runtime_endpoints,
            image_endpoints: opts.image_endpoints.unwrap_or_default(),
            pod_logs_root: opts.pod_logs_root,
            runtime_request_timeout: Duration::from_secs(opts.runtime_request_timeout),
            sync_frequency: Duration::from_secs(opts.sync_frequency),
            in_place_resize_enabled: !opts.disable_in_place_resize,
            nic_hotplug_enabled: !opts.disable_nic_hotplug,
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
            default_termination_grace_period: opts.default_termination_grace_period,
            min_kill_grace_period: DEFAULT_MIN_KILL_GRACE_PERIOD_SECS,
        })
    }
}

/// CLI options that can be configured for Kubelet
///
/// These can be parsed from args using `Opts::into_app()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "arktos-kubelet",
    about = "A kubelet driving container and VM runtimes side by side"
)]
pub struct Opts {
    #[structopt(
        long = "runtime-endpoints",
        default_value = DEFAULT_RUNTIME_ENDPOINT,
        env = "ARKTOS_RUNTIME_ENDPOINTS",
        help = "Runtime endpoints separated by ';'. Each is a bare URL or name,workloadType,url
        where workloadType is 'container' or 'vm'"
    )]
    runtime_endpoints: String,

    #[structopt(
        long = "image-endpoints",
        env = "ARKTOS_IMAGE_ENDPOINTS",
        help = "Image endpoints in the same form as --runtime-endpoints. Defaults to the runtime endpoints"
    )]
    image_endpoints: Option<String>,

    #[structopt(
        long = "pod-logs-root",
        default_value = DEFAULT_POD_LOGS_ROOT,
        env = "ARKTOS_POD_LOGS_ROOT",
        help = "The directory pod logs are written under"
    )]
    pod_logs_root: PathBuf,

    #[structopt(
        long = "runtime-request-timeout",
        default_value = "15",
        env = "ARKTOS_RUNTIME_REQUEST_TIMEOUT",
        help = "Seconds every runtime call may take"
    )]
    runtime_request_timeout: u64,

    #[structopt(
        long = "sync-frequency",
        default_value = "10",
        env = "ARKTOS_SYNC_FREQUENCY",
        help = "Seconds between periodic syncs of every pod"
    )]
    sync_frequency: u64,

    #[structopt(
        long = "disable-in-place-resize",
        env = "ARKTOS_DISABLE_IN_PLACE_RESIZE",
        help = "Restart containers instead of resizing them in place"
    )]
    disable_in_place_resize: bool,

    #[structopt(
        long = "disable-nic-hotplug",
        env = "ARKTOS_DISABLE_NIC_HOTPLUG",
        help = "Never attach or detach NICs of running sandboxes"
    )]
    disable_nic_hotplug: bool,

    #[structopt(
        long = "default-termination-grace-period",
        default_value = "30",
        env = "ARKTOS_DEFAULT_TERMINATION_GRACE_PERIOD",
        help = "Seconds containers get to stop when the pod declares no grace period"
    )]
    default_termination_grace_period: i64,

    #[structopt(
        long = "hostname",
        env = "ARKTOS_HOSTNAME",
        help = "The hostname for this node, defaults to the hostname of this machine"
    )]
    hostname: Option<String>,

    #[structopt(
        long = "node-name",
        env = "ARKTOS_NODE_NAME",
        help = "The name for this node, defaults to the hostname of this machine"
    )]
    node_name: Option<String>,
}

fn default_hostname() -> anyhow::Result<String> {
    hostname::get()?
        .into_string()
        .map_err(|_| anyhow::anyhow!("invalid utf-8 hostname string"))
}

// Some hostnames (particularly local ones) can have uppercase letters, which is
// disallowed by the DNS spec used in kubernetes naming. This sanitizes those
// names
fn sanitize_hostname(hostname: &str) -> String {
    hostname.to_lowercase()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default_config().unwrap();
        assert_eq!(config.node_name, config.hostname.to_lowercase());
        assert_eq!(config.runtime_request_timeout, Duration::from_secs(15));
        assert_eq!(config.pod_logs_root, PathBuf::from("/var/log/pods"));
        assert!(config.image_endpoints.is_empty());
        assert_eq!(config.backoff_base, Duration::from_secs(10));
        assert_eq!(config.backoff_max, Duration::from_secs(300));
        assert_eq!(config.default_termination_grace_period, 30);
        assert_eq!(config.min_kill_grace_period, 2);
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("Node-A.Local"), "node-a.local");
    }

    #[cfg(feature = "cli")]
    #[test]
    fn test_opts() {
        let opts = Opts::from_iter(vec![
            "arktos-kubelet",
            "--runtime-endpoints",
            "c1,container,unix:///c.sock;vm1,vm,unix:///v.sock",
            "--hostname",
            "Worker",
            "--disable-nic-hotplug",
        ]);
        let config = Config::from_opts(opts).unwrap();
        assert_eq!(config.node_name, "worker");
        assert!(!config.nic_hotplug_enabled);
        assert!(config.in_place_resize_enabled);
        assert_eq!(
            config.runtime_endpoints,
            "c1,container,unix:///c.sock;vm1,vm,unix:///v.sock"
        );
    }
}
