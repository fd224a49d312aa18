use std::path::Path;

use colored::Colorize;

pub fn run_report(report: &gantry::RunReport, state: &Path) {
    let group = &report.group;
    println!("{} {}", "test group".bold(), group.id.cyan());

    for host in &group.hosts {
        println!(
            "  {} {:<16} {:<32} {}@{}",
            "ok".green(),
            host.name(),
            host.instance_name,
            host.user,
            host.ip,
        );
    }
    for failure in &report.failures {
        println!("  {} {failure}", "failed".red());
    }
    if let Some(error) = &report.aborted {
        println!("  {} {error}", "aborted".red());
    }

    println!("state written to {}", state.display().to_string().yellow());
    if !report.is_complete() {
        println!(
            "run {} to clean up",
            format!("gantry teardown --state {}", state.display()).yellow()
        );
    }
}

pub fn teardown_report(report: &gantry::TeardownReport) {
    for name in &report.deleted {
        println!("  {} {name}", "deleted".green());
    }
    for name in &report.missing {
        println!("  {} {name}", "gone".dimmed());
    }
    for (name, error) in &report.failed {
        println!("  {} {name}: {error}", "failed".red());
    }
}

pub fn reap_report(report: &gantry::ReapReport) {
    for (kind, name) in &report.deleted {
        println!("  {} {kind} {name}", "reaped".green());
    }
    for (kind, name, error) in &report.failed {
        println!("  {} {kind} {name}: {error}", "failed".red());
    }
    println!("{} resources kept", report.kept);
}

pub fn config_summary(config: &gantry::Config, keys: &gantry::Result<gantry::KeyPair>) {
    println!("{:<14} {}", "project".bold(), config.project);
    println!("{:<14} {}", "zone".bold(), config.zone);
    println!(
        "{:<14} {}{}",
        "network".bold(),
        config.network,
        config
            .subnetwork
            .as_deref()
            .map(|s| format!(" / {s}"))
            .unwrap_or_default()
    );

    let ports: Vec<String> = config.ports.iter().map(ToString::to_string).collect();
    println!("{:<14} 22/tcp {}", "ports".bold(), ports.join(" "));

    match keys {
        Ok(pair) => println!("{:<14} {}", "ssh key".bold(), pair.private_key.display()),
        Err(e) => println!("{:<14} {}", "ssh key".bold(), e.to_string().red()),
    }

    for host in &config.hosts {
        let selector = host
            .image
            .as_deref()
            .map(|i| format!("image {i}"))
            .or_else(|| host.family.as_deref().map(|f| format!("family {f}")))
            .unwrap_or_default();
        println!(
            "  {} {:<16} {:<40} {}",
            "host".cyan(),
            host.name,
            selector,
            config.machine_type_for(host)
        );
    }
}
