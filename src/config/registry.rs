use super::*;

fn default_mailbox() -> String {
    "factory".into()
}

fn four() -> usize {
    4
}

fn sixteen() -> u32 {
    16
}

fn default_connect_timeout() -> u64 {
    5000
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Registry {
    #[serde(default = "default_mailbox")]
    mailbox: String,
    // number of threads for worker tasks
    #[serde(default = "four")]
    threads: usize,
    /// Socket buffer size, in KB, for cluster clients built when no usable
    /// buffer size was requested.
    #[serde(default = "sixteen")]
    default_buffer_kb: u32,
    // milliseconds
    #[serde(default = "default_connect_timeout")]
    connect_timeout: u64,
    /// Hand every worker spawned with the same client config the same client.
    #[serde(default)]
    share_clients: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            mailbox: default_mailbox(),
            threads: four(),
            default_buffer_kb: sixteen(),
            connect_timeout: default_connect_timeout(),
            share_clients: false,
        }
    }
}

impl Registry {
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn threads(&self) -> usize {
        std::cmp::max(1, self.threads)
    }

    pub fn default_buffer_kb(&self) -> u32 {
        self.default_buffer_kb
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn share_clients(&self) -> bool {
        self.share_clients
    }
}

/// What a worker does with a message it can't decode.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Answer `{error, Reason}` and keep serving.
    #[default]
    Reply,
    /// Stop the worker without replying.
    Terminate,
}

#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Worker {
    #[serde(default)]
    decode_error_policy: DecodePolicy,
}

impl Worker {
    pub fn decode_error_policy(&self) -> DecodePolicy {
        self.decode_error_policy
    }
}
