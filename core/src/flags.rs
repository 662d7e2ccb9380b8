use env_flags::env_flags;

env_flags! {
    /// Base URL of the agent server the engine talks to.
    pub COURIER_AGENT_URL: &str = "http://localhost:8000";

    /// Base64-encoded 32-byte AES-256-GCM key protecting credential bags at
    /// rest. When unset, credential bags are stored as plaintext JSON.
    pub COURIER_CREDENTIAL_KEY: Option<&str> = None;
}
