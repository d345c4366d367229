use crate::cli::CliOpt;
use testbed_core::config::EngineConfig;
use testbed_core::event::EventLog;
use testbed_core::impairment::ImpairmentState;
use testbed_core::instance::TopologyInstance;
use testbed_core::topology::compiler::ValidationReport;

pub fn print_params(options: &CliOpt, config: &EngineConfig) {
    println!("--- Params ---");
    println!("* Topology path: {}", options.topology.display());
    if let Some(path) = &options.config {
        println!("* Config path: {}", path.display());
    }
    println!("* Address pool: {}", config.address_pool);
    match config.default_asn {
        Some(asn) => println!("* Default ASN: {asn}"),
        None => println!("* Default ASN: none"),
    }
}

pub fn print_validation(report: &ValidationReport) {
    if !report.errors.is_empty() {
        println!("--- Errors ---");
        for error in &report.errors {
            println!("* {error}");
        }
    }

    if !report.warnings.is_empty() {
        println!("--- Warnings ---");
        for warning in &report.warnings {
            println!("* {warning}");
        }
    }

    println!("--- Result ---");
    if report.is_valid() {
        println!(
            "* Valid ({} errors, {} warnings)",
            report.errors.len(),
            report.warnings.len()
        );
    } else {
        println!(
            "* Invalid ({} errors, {} warnings)",
            report.errors.len(),
            report.warnings.len()
        );
    }
}

pub fn print_topology(instance: &TopologyInstance) {
    let topology = instance.topology();
    println!("--- Topology ---");
    println!("* Name: {}", topology.name);
    println!("* Nodes:");
    for node in &topology.nodes {
        match node.asn {
            Some(asn) => println!("  * {} ({}, AS{asn})", node.id, node.kind),
            None => println!("  * {} ({})", node.id, node.kind),
        }
    }
    println!("* Links:");
    for link in &topology.links {
        println!("  * {}: {} <-> {}", link.id, link.src, link.dst);
    }

    for warning in instance.warnings() {
        println!("* Warning: {warning}");
    }
}

pub fn print_addresses(instance: &TopologyInstance) {
    println!("--- Addresses ---");
    for assignment in &instance.addresses().assignments {
        println!("* {} ({}):", assignment.link_id, assignment.block());
        println!(
            "  * {}: {}/{}",
            assignment.src_node, assignment.src_ip, assignment.prefix_len
        );
        println!(
            "  * {}: {}/{}",
            assignment.dst_node, assignment.dst_ip, assignment.prefix_len
        );
    }
}

pub fn print_routes(instance: &TopologyInstance) {
    println!("--- Routes ---");
    for (node, routes) in instance.routes().iter() {
        println!("* {node}:");
        for route in routes {
            println!("  * {} via {}", route.destination, route.next_hop);
        }
        for command in instance.route_commands(node) {
            println!("  |-> {command}");
        }
    }
}

pub fn print_resources(instance: &TopologyInstance) {
    let estimate = instance.resources();
    println!("--- Resources ---");
    println!("* CPU cores: {:.2}", estimate.cpu_cores);
    println!("* Memory: {} MB", estimate.memory_mb);
    println!(
        "* {} nodes ({} routers), {} links, {} services",
        estimate.node_count, estimate.router_count, estimate.link_count, estimate.service_count
    );
}

pub fn print_scenarios(instance: &TopologyInstance) {
    println!("--- Scenarios ---");
    let status = instance.scheduler().status();
    if status.is_empty() {
        println!("* None");
    }
    for scenario in status {
        println!("* {} ({}): {}", scenario.id, scenario.kind, scenario.state);
    }
}

pub fn print_impairments(instance: &TopologyInstance) {
    println!("--- Impairments ---");
    let snapshot = instance.engine().snapshot();
    let touched: Vec<_> = snapshot
        .iter()
        .filter(|(_, state)| **state != ImpairmentState::Cleared)
        .collect();

    if touched.is_empty() {
        println!("* None");
    }
    for (interface, state) in touched {
        println!("* {interface}:");
        match state {
            ImpairmentState::Applied(spec) => {
                for command in spec.tc_commands(&interface.name) {
                    println!("  |-> {command}");
                }
            }
            ImpairmentState::Unknown => println!("  |-> unknown (a driver call did not report back)"),
            ImpairmentState::Cleared => {}
        }
    }
}

pub fn print_events(events: &EventLog) {
    println!("--- Events ---");
    for event in events.snapshot() {
        println!("* [{}] {}", event.kind, event.message);
    }
}
