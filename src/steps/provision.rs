// Provision step - obtain the guests tests will run on

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{read_yaml, write_yaml, StepKind};
use crate::guest::{
    from_record, Guest, GuestContext, GuestData, GuestLocal, GuestRecord, GuestSsh, GuestSshData,
};
use crate::output::errors::TestbedError;
use crate::plugins::{Phase, PhaseContext, PhaseData, Plugin, PluginRegistry};

/// Saved guests, keyed by guest name
pub const GUESTS_FILENAME: &str = "guests.yaml";

pub fn register(registry: &mut PluginRegistry) {
    registry.register(StepKind::Provision, "local", |data| {
        Ok(Phase::Plugin(Box::new(ProvisionLocal::new(data))))
    });
    registry.register(StepKind::Provision, "connect", |data| {
        Ok(Phase::Plugin(Box::new(ProvisionConnect::new(data)?)))
    });
}

/// Use the runner itself as the guest
pub struct ProvisionLocal {
    data: PhaseData,
    guest: Option<Arc<dyn Guest>>,
}

impl ProvisionLocal {
    pub fn new(data: PhaseData) -> Self {
        ProvisionLocal { data, guest: None }
    }
}

#[async_trait]
impl Plugin for ProvisionLocal {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    async fn go(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        let data = GuestData {
            role: self.data.get_str("role").map(str::to_string),
            guest: None,
        };
        let guest = GuestLocal::new(self.name(), data, ctx.guest_context());
        ctx.output.info("guest", guest.address().unwrap_or("localhost"), 2);

        guest.start().await?;
        self.guest = Some(Arc::new(guest));
        Ok(())
    }

    fn guest(&self) -> Option<Arc<dyn Guest>> {
        self.guest.clone()
    }
}

/// Connect to an already running host over SSH
pub struct ProvisionConnect {
    data: PhaseData,
    ssh: GuestSshData,
    guest: Option<Arc<dyn Guest>>,
}

impl ProvisionConnect {
    pub fn new(data: PhaseData) -> Result<Self, TestbedError> {
        let port = match data.get_u64("port") {
            Some(port) => Some(u16::try_from(port).map_err(|_| {
                TestbedError::specification(format!("Invalid port '{}' of phase '{}'.", port, data.name()))
            })?),
            None => None,
        };

        let ssh = GuestSshData {
            role: data.get_str("role").map(str::to_string),
            guest: data.get_str("guest").map(str::to_string),
            port,
            user: data.get_str("user").unwrap_or("root").to_string(),
            key: data.get_strings("key").into_iter().map(PathBuf::from).collect(),
            password: data.get_str("password").map(str::to_string),
            ssh_option: data.get_strings("ssh-option"),
        };

        Ok(ProvisionConnect {
            data,
            ssh,
            guest: None,
        })
    }
}

#[async_trait]
impl Plugin for ProvisionConnect {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    fn lint(&self) -> Vec<String> {
        if self.ssh.guest.is_none() {
            vec!["'guest' is required for the connect method".to_string()]
        } else {
            Vec::new()
        }
    }

    async fn go(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        let Some(address) = self.ssh.guest.as_deref() else {
            return Err(TestbedError::general(
                "Provide a host name or an ip address to connect.",
            ));
        };

        ctx.output.info("guest", address, 2);
        ctx.output.info("user", &self.ssh.user, 2);
        if let Some(port) = self.ssh.port {
            ctx.output.verbose("port", port.to_string(), 1, 2);
        }
        for key in &self.ssh.key {
            ctx.output.verbose("key", key.display().to_string(), 1, 2);
        }
        if self.ssh.password.is_some() {
            ctx.output.verbose("password", "*****", 1, 2);
        }

        let guest = GuestSsh::new(self.name(), self.ssh.clone(), ctx.guest_context());
        guest.start().await?;
        self.guest = Some(Arc::new(guest));
        Ok(())
    }

    fn guest(&self) -> Option<Arc<dyn Guest>> {
        self.guest.clone()
    }
}

/// Show guest details and keep every guest which made it
///
/// Guests which are ready are recorded even when the phase failed, so
/// they can be cleaned up later.
pub(super) async fn record_guest(
    ctx: &mut PhaseContext<'_>,
    plugin: &dyn Plugin,
    result: Result<(), TestbedError>,
) -> Result<(), TestbedError> {
    let Some(guest) = plugin.guest() else {
        return result;
    };

    let mut result = result;
    if result.is_ok() && !ctx.options.dry {
        match guest.details().await {
            Ok(facts) => {
                if let Some(distro) = facts.distro {
                    ctx.output.info("distro", distro, 2);
                }
                if let Some(kernel) = facts.kernel {
                    ctx.output.verbose("kernel", kernel, 1, 2);
                }
            }
            Err(err) => result = Err(err),
        }
    }

    if guest.is_ready() || ctx.options.dry {
        debug!(guest = %guest.full_name(), "guest provisioned");
        ctx.state.guests.push(guest);
    }
    result
}

/// Multihost plans address guests by name, two phases can't share one
pub fn check_unique_names(phases: &[PhaseData]) -> Result<(), TestbedError> {
    let mut seen = HashSet::new();
    for phase in phases {
        if !seen.insert(phase.name()) {
            return Err(TestbedError::specification(format!(
                "Provision step names must be unique for multihost testing, '{}' is used more than once.",
                phase.name()
            )));
        }
    }
    Ok(())
}

pub fn save_guests(workdir: &Path, guests: &[Arc<dyn Guest>], dry: bool) -> Result<(), TestbedError> {
    if dry {
        return Ok(());
    }

    let mut mapping = serde_yaml::Mapping::new();
    for guest in guests {
        mapping.insert(
            serde_yaml::Value::String(guest.name().to_string()),
            guest.save().to_value()?,
        );
    }
    write_yaml(&workdir.join(GUESTS_FILENAME), &mapping)
}

pub fn load_guests(workdir: &Path, context: GuestContext) -> Result<Vec<Arc<dyn Guest>>, TestbedError> {
    let Some(mapping) = read_yaml::<serde_yaml::Mapping>(&workdir.join(GUESTS_FILENAME))? else {
        return Ok(Vec::new());
    };

    let mut guests = Vec::with_capacity(mapping.len());
    for (name, value) in mapping {
        let name = name.as_str().map(str::to_string).ok_or_else(|| {
            TestbedError::general(format!("Invalid guest name in '{}'.", GUESTS_FILENAME))
        })?;
        let record = GuestRecord::from_value(value)?;
        guests.push(from_record(&name, record, context.clone()));
    }
    Ok(guests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::executor::SystemRunner;
    use crate::plugins::{testing, PlanState};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unique_names() {
        let phases = vec![
            PhaseData::new("connect").with_name("server"),
            PhaseData::new("connect").with_name("client"),
        ];
        assert!(check_unique_names(&phases).is_ok());

        let duplicate = vec![
            PhaseData::new("connect").with_name("server"),
            PhaseData::new("local").with_name("server"),
        ];
        let err = check_unique_names(&duplicate).unwrap_err();
        assert!(err.message().contains("must be unique"));
    }

    #[test]
    fn test_connect_data() {
        let data: PhaseData = serde_yaml::from_str(
            "how: connect\nname: server\nguest: 10.0.0.5\nport: 2222\nuser: fedora\nkey: [/a, /b]\nrole: server\n",
        )
        .unwrap();
        let plugin = ProvisionConnect::new(data).unwrap();

        assert_eq!(plugin.ssh.guest.as_deref(), Some("10.0.0.5"));
        assert_eq!(plugin.ssh.port, Some(2222));
        assert_eq!(plugin.ssh.user, "fedora");
        assert_eq!(plugin.ssh.key, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(plugin.lint().is_empty());

        let bad_port = PhaseData::new("connect").with_key("port", 70000u64);
        assert!(ProvisionConnect::new(bad_port).is_err());
    }

    #[tokio::test]
    async fn test_connect_requires_guest() {
        let dir = tempfile::tempdir().unwrap();
        let plan = testing::plan(dir.path(), dir.path(), "");
        let mut state = PlanState::default();
        let mut ctx = testing::context(StepKind::Provision, &plan, &mut state, Options::default());

        let mut plugin = ProvisionConnect::new(PhaseData::new("connect")).unwrap();
        assert_eq!(plugin.lint().len(), 1);
        let err = plugin.go(&mut ctx).await.unwrap_err();
        assert_eq!(err.message(), "Provide a host name or an ip address to connect.");
        assert!(plugin.guest().is_none());
    }

    #[tokio::test]
    async fn test_local_guest_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let plan = testing::plan(dir.path(), dir.path(), "");
        let mut state = PlanState::default();
        let dry = Options {
            dry: true,
            ..Default::default()
        };
        let mut ctx = testing::context(StepKind::Provision, &plan, &mut state, dry);

        let mut plugin = ProvisionLocal::new(PhaseData::new("local").with_name("default-0"));
        let result = plugin.go(&mut ctx).await;
        record_guest(&mut ctx, &plugin, result).await.unwrap();

        assert_eq!(state.guests.len(), 1);
        assert_eq!(state.guests[0].name(), "default-0");
        assert!(state.guests[0].is_localhost());
    }

    #[test]
    fn test_guests_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let context = GuestContext::new(dir.path(), Arc::new(SystemRunner));
        assert!(load_guests(dir.path(), context.clone()).unwrap().is_empty());

        let ssh = GuestSshData {
            role: Some("server".into()),
            guest: Some("10.0.0.5".into()),
            port: Some(22),
            ..Default::default()
        };
        let guests: Vec<Arc<dyn Guest>> = vec![
            Arc::new(GuestSsh::new("server", ssh.clone(), context.clone())),
            Arc::new(GuestLocal::new("client", GuestData::default(), context.clone())),
        ];
        save_guests(dir.path(), &guests, false).unwrap();

        let loaded = load_guests(dir.path(), context).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name(), "server");
        assert_eq!(loaded[0].save(), GuestRecord::Ssh(ssh));
        assert_eq!(loaded[1].name(), "client");
        assert!(loaded[1].is_localhost());
    }

    #[test]
    fn test_dry_run_does_not_save_guests() {
        let dir = tempfile::tempdir().unwrap();
        save_guests(dir.path(), &[], true).unwrap();
        assert!(!dir.path().join(GUESTS_FILENAME).exists());
    }
}
