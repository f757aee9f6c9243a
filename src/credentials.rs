use anyhow::Result;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const ENV_PASSWORD: &str = "AIRSYNC_PASSWORD";
const KEYRING_SERVICE: &str = "airsync";

/// Looks up the server password for one account: environment variable first,
/// then the system keyring, then a private file in the config directory.
pub struct CredentialStore {
    email: String,
    password_file: PathBuf,
}

impl CredentialStore {
    pub fn new(email: &str) -> Self {
        let safe_email = email.replace(['@', '.', '/', '\\', ':'], "_");
        let password_file = crate::config::Config::config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(format!(".password_{}", safe_email));

        Self {
            email: email.to_string(),
            password_file,
        }
    }

    fn env_password() -> Option<String> {
        env::var(ENV_PASSWORD).ok().filter(|p| !p.is_empty())
    }

    fn keyring_key(&self) -> String {
        format!("eas:{}", self.email)
    }

    fn keyring_get(&self) -> Option<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, &self.keyring_key()).ok()?;
        entry.get_password().ok()
    }

    fn keyring_set(&self, password: &str) -> bool {
        keyring::Entry::new(KEYRING_SERVICE, &self.keyring_key())
            .and_then(|entry| entry.set_password(password))
            .is_ok()
    }

    fn file_get(&self) -> Option<String> {
        fs::read_to_string(&self.password_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Write the fallback file readable by the owner only.
    fn file_set(&self, password: &str) -> Result<()> {
        if let Some(parent) = self.password_file.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.password_file)?;
            file.write_all(password.as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.password_file, password)?;
        }

        Ok(())
    }

    pub fn password(&self) -> Result<String> {
        if let Some(pwd) = Self::env_password() {
            return Ok(pwd);
        }
        if let Some(pwd) = self.keyring_get() {
            return Ok(pwd);
        }
        if let Some(pwd) = self.file_get() {
            return Ok(pwd);
        }

        anyhow::bail!(
            "Password for {} not found. Set {} or store it with 'airsync password'.",
            self.email,
            ENV_PASSWORD
        )
    }

    pub fn set_password(&self, password: &str) -> Result<()> {
        if self.keyring_set(password) && self.keyring_get().as_deref() == Some(password) {
            return Ok(());
        }

        tracing::info!("Keyring unavailable, storing password for {} in a file", self.email);
        self.file_set(password)
    }

    pub fn has_credentials(&self) -> bool {
        Self::env_password().is_some() || self.keyring_get().is_some() || self.file_get().is_some()
    }
}
