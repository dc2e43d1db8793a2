//! Command line of the scheduler binary.

use std::path::PathBuf;
use std::time::Duration;

use compute_client::client::{ClientConfig, ClientProtocol};
use compute_client::secrets::Credentials;
use scheduler::config::SchedulerConfig;
use structopt::StructOpt;

/// CLI options of the scheduler
#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "arktos-scheduler",
    about = "Schedules VM pods onto compute-API compatible clouds"
)]
pub struct Opts {
    #[structopt(
        long = "host",
        env = "ARKTOS_CLOUD_HOSTS",
        use_delimiter = true,
        required = true,
        help = "Cloud hosts to schedule onto, as address[:port] or URL. Repeat or separate with ','"
    )]
    hosts: Vec<String>,

    #[structopt(
        long = "manifests",
        env = "ARKTOS_MANIFEST_DIR",
        help = "Directory of JSON or YAML pod manifests to schedule"
    )]
    manifests: PathBuf,

    #[structopt(
        long = "credentials-file",
        env = "ARKTOS_CREDENTIALS_FILE",
        help = "JSON file holding the cloud credentials. Defaults to the ARKTOS_CLOUD_* variables"
    )]
    credentials_file: Option<PathBuf>,

    #[structopt(long = "https", env = "ARKTOS_CLOUD_HTTPS", takes_value = false, help = "Reach hosts over https")]
    https: bool,

    #[structopt(
        long = "request-timeout",
        default_value = "15",
        env = "ARKTOS_REQUEST_TIMEOUT",
        help = "Seconds every cloud request may take"
    )]
    request_timeout: u64,

    #[structopt(
        long = "poll-interval",
        default_value = "2",
        env = "ARKTOS_POLL_INTERVAL",
        help = "Seconds between two status polls of a building server"
    )]
    poll_interval: u64,

    #[structopt(
        long = "max-build-polls",
        default_value = "60",
        env = "ARKTOS_MAX_BUILD_POLLS",
        help = "Polls after which a server still building is deleted and its pod rescheduled"
    )]
    max_build_polls: u32,

    #[structopt(
        long = "reschedule-limit",
        default_value = "3",
        env = "ARKTOS_RESCHEDULE_LIMIT",
        help = "Attempts a pod gets before it is marked failed"
    )]
    reschedule_limit: u32,
}

impl Opts {
    /// The scheduler configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval),
            max_build_polls: self.max_build_polls,
            reschedule_limit: self.reschedule_limit,
            ..SchedulerConfig::with_hosts(self.hosts.clone())
        }
    }

    /// The configuration of the cloud client.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            protocol: if self.https {
                ClientProtocol::Https
            } else {
                ClientProtocol::Http
            },
            request_timeout: Duration::from_secs(self.request_timeout),
        }
    }

    /// Loads the credentials from the file, or from the environment when no file is given.
    pub async fn credentials(&self) -> anyhow::Result<Credentials> {
        match &self.credentials_file {
            Some(path) => Credentials::from_file(path).await,
            None => Credentials::from_env(),
        }
    }

    /// The directory pod manifests are read from.
    pub fn manifests(&self) -> &PathBuf {
        &self.manifests
    }
}
