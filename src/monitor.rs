use log::{error, info, warn};

use crate::alert::{Alert, Delivery, Dispatcher};
use crate::config::{Config, Features, InterfaceConfig};
use crate::error::Error;
use crate::isp::IspVerifier;
use crate::net::Egress;
use crate::probe::{Prober, TlsProber};
use crate::state::{InterfaceStatus, PersistedState, StateDelta, StateStore};

/// What one check cycle observed and did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub state: PersistedState,
    pub delta: StateDelta,
    /// Last interface found up, in configuration order.
    pub working_interface: Option<String>,
    /// Alert built from the delta, whether or not it was sent.
    pub alert: Option<Alert>,
    pub deliveries: Vec<Delivery>,
}

/// Runs one probe, compare, persist and alert cycle.
pub struct Monitor {
    interfaces: Vec<InterfaceConfig>,
    targets: Vec<String>,
    store: StateStore,
    prober: Box<dyn Prober>,
    verifier: Option<IspVerifier>,
    dispatcher: Dispatcher,
    dry_run: bool,
}

impl Monitor {
    pub fn new(
        interfaces: Vec<InterfaceConfig>,
        targets: Vec<String>,
        store: StateStore,
        prober: Box<dyn Prober>,
    ) -> Self {
        Self {
            interfaces,
            targets,
            store,
            prober,
            verifier: None,
            dispatcher: Dispatcher::default(),
            dry_run: false,
        }
    }

    /// Wires the real network collaborators for the resolved features.
    ///
    /// # Errors
    ///
    /// Fails if a TLS client configuration cannot be built.
    pub fn from_config(config: &Config, features: &Features) -> Result<Self, Error> {
        let monitor = Self::new(
            config.interfaces.clone(),
            config.targets.clone(),
            StateStore::new(&config.state_file),
            Box::new(TlsProber::new(config.probe_timeout)?),
        )
        .with_dispatcher(Dispatcher::from_config(config, features)?)
        .dry_run(features.dry_run);

        Ok(if features.whois {
            monitor.with_verifier(IspVerifier::from_config(&config.whois))
        } else {
            monitor
        })
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: IspVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Probes every interface in order, then persists and alerts.
    ///
    /// Alerts are still dispatched when saving the state fails.
    ///
    /// # Errors
    ///
    /// Returns the state file write error, after dispatching.
    pub async fn run_cycle(&self) -> Result<CycleReport, Error> {
        let previous = self.store.load();
        let mut report = CycleReport::default();

        for iface in &self.interfaces {
            info!("Testing {} ({})...", iface.label, iface.name);
            let prior = previous.get(&iface.name).copied();
            let status = self.check_interface(iface, prior, &mut report).await;
            report.state.insert(iface.name.clone(), status);
        }

        let saved = if self.dry_run {
            info!("Dry run, not saving state to {}", self.store.path().display());
            Ok(())
        } else {
            self.store.save(&report.state)
        };
        if let Err(e) = &saved {
            error!("Failed to save state to {}: {e}", self.store.path().display());
        }

        report.alert = Alert::from_delta(&report.delta);
        match &report.alert {
            None => info!("No state changes detected, no alerts sent"),
            Some(alert) if self.dry_run => {
                info!("Dry run, would send:\n{}", alert.body);
            }
            Some(_) if self.dispatcher.is_empty() => {
                warn!("State changed but no alert channel is enabled");
            }
            Some(alert) => {
                let egress = Egress::bound_to(report.working_interface.as_deref());
                report.deliveries = self.dispatcher.dispatch(alert, &egress).await;
            }
        }

        saved.map(|()| report)
    }

    async fn check_interface(
        &self,
        iface: &InterfaceConfig,
        previous: Option<InterfaceStatus>,
        report: &mut CycleReport,
    ) -> InterfaceStatus {
        let mut probe = self.prober.probe(&iface.name, &self.targets).await;

        if let (true, Some(verifier), Some(expected)) =
            (probe.successful, &self.verifier, &iface.expected_org)
        {
            info!("Verifying ISP for {}...", iface.name);
            if !verifier.verify(&iface.name, expected).await {
                probe.successful = false;
                probe.failures.push(format!("ISP mismatch (expected {expected})"));
            }
        }

        if probe.successful {
            report.working_interface = Some(iface.name.clone());
            if previous == Some(InterfaceStatus::Down) {
                info!("{} ({}) restored", iface.label, iface.name);
                report.delta.restored.push(iface.label.clone());
            }
            InterfaceStatus::Up
        } else {
            warn!("{} ({}) is DOWN", iface.label, iface.name);
            if previous == Some(InterfaceStatus::Up) {
                report.delta.new_failures.push(format!(
                    "{} ({}):\n  {}",
                    iface.label,
                    iface.name,
                    probe.failures.join("\n  ")
                ));
            }
            InterfaceStatus::Down
        }
    }
}
