//! One-shot checks of the alert channels and the ISP lookup path.
//!
//! These talk to a human at a terminal, so they print instead of logging.

use std::fmt::Write as _;

use chrono::{DateTime, Local};

use crate::alert::{Alert, Dispatcher};
use crate::config::InterfaceConfig;
use crate::isp::{IspLookup, IspVerifier, org_matches};
use crate::net::Egress;

fn test_alert(now: DateTime<Local>) -> Alert {
    Alert::new(
        "Test Alert",
        format!(
            "This is a test alert.\nTimestamp: {}\n\n\
             If you received this message, the notification channel is configured correctly.",
            now.format("%Y-%m-%d %H:%M:%S")
        ),
    )
}

/// Sends a test message on every enabled channel over the default route.
///
/// Returns true only if at least one channel is enabled and all succeed.
pub async fn test_alerts(dispatcher: &Dispatcher) -> bool {
    if dispatcher.is_empty() {
        eprintln!(
            "Error: No notification channels are enabled. Configure email or Telegram, \
             or use --email / --telegram to force-enable."
        );
        return false;
    }

    let deliveries = dispatcher
        .dispatch(&test_alert(Local::now()), &Egress::DefaultRoute)
        .await;

    let mut all_ok = true;
    for delivery in deliveries {
        match delivery.result {
            Ok(()) => println!("  {}: OK", delivery.channel),
            Err(e) => {
                eprintln!("  {}: FAILED \u{2014} {e}", delivery.channel);
                all_ok = false;
            }
        }
    }
    all_ok
}

/// Looks up the public IP and WHOIS organization over the default route.
///
/// Unlike cycle verification this is strict: any lookup failure fails.
pub async fn test_whois(verifier: &IspVerifier, interfaces: &[InterfaceConfig]) -> bool {
    println!("Fetching public IP via {}...", verifier.lookup_url());
    match verifier.lookup(&Egress::DefaultRoute).await {
        Ok(lookup) => {
            print!("{}", whois_report(&lookup, interfaces));
            true
        }
        Err(e) => {
            eprintln!("  Lookup: FAILED \u{2014} {e}");
            false
        }
    }
}

fn whois_report(lookup: &IspLookup, interfaces: &[InterfaceConfig]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  Public IP: {}", lookup.ip);
    let _ = writeln!(out, "  WHOIS org: {}", lookup.org);

    if interfaces.iter().any(|i| i.expected_org.is_some()) {
        out.push_str("\nInterface matches:\n");
        for iface in interfaces {
            match &iface.expected_org {
                Some(expected) => {
                    let verdict = if org_matches(expected, &lookup.org) {
                        "matches"
                    } else {
                        "MISMATCH"
                    };
                    let _ = writeln!(
                        out,
                        "  {} ({}): expected \"{expected}\" \u{2014} {verdict}",
                        iface.name, iface.label
                    );
                }
                None => {
                    let _ = writeln!(
                        out,
                        "  {} ({}): no expected org configured",
                        iface.name, iface.label
                    );
                }
            }
        }
    }
    out
}
