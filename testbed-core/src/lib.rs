pub mod config;
pub mod event;
pub mod impairment;
pub mod instance;
pub mod routing;
pub mod scenario;
pub mod scheduler;
pub mod topology;

#[cfg(test)]
mod test {
    use crate::config::EngineConfig;
    use crate::event::EventKind;
    use crate::impairment::ImpairmentState;
    use crate::impairment::memory::MemoryDriver;
    use crate::instance::TopologyInstance;
    use crate::routing::RouteEntry;
    use crate::scheduler::{ScenarioState, TriggerOutcome};
    use crate::topology::compiler::{CompileError, ValidationError, compile};
    use crate::topology::document::Document;
    use bon::builder;
    use chrono::TimeDelta;
    use std::sync::Arc;
    use std::time::Duration;

    const LINE_TOPOLOGY: &str = r#"
topology:
  name: line
  nodes:
    - { id: h1, type: host }
    - { id: r1, type: router }
    - { id: h2, type: host }
  links:
    - [h1, r1]
    - [r1, h2]
"#;

    struct Testbed {
        driver: Arc<MemoryDriver>,
        instance: TopologyInstance,
    }

    #[builder]
    async fn testbed(scenarios: Option<&'static str>) -> Testbed {
        let yaml = format!("{LINE_TOPOLOGY}{}", scenarios.unwrap_or_default());
        let config = EngineConfig::default();
        let compiled = compile(
            Document::from_yaml_str(&yaml).unwrap(),
            &config.compiler_config(),
        )
        .unwrap();

        let driver = Arc::new(MemoryDriver::new(&compiled.topology));
        let instance = TopologyInstance::from_compiled(compiled, driver.clone(), &config)
            .await
            .unwrap();
        instance.start();

        Testbed { driver, instance }
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_topology() {
        let testbed = testbed().call().await;
        let instance = &testbed.instance;

        assert!(instance.warnings().is_empty());
        assert!(instance.routes().of("h1").contains(&RouteEntry {
            destination: "h2".into(),
            next_hop: "r1".into(),
        }));

        let commands: Vec<_> = instance
            .route_commands("h1")
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(
            commands,
            [
                "ip route add 10.0.255.254/32 via 10.0.255.254",
                "ip route add 10.0.255.250/32 via 10.0.255.254",
            ]
        );
    }

    #[test]
    fn test_dangling_link_is_rejected() {
        let yaml = LINE_TOPOLOGY.replace("- [r1, h2]", "- [r1, h2]\n    - [r1, h3]");
        let result = compile(
            Document::from_yaml_str(&yaml).unwrap(),
            &EngineConfig::default().compiler_config(),
        );

        let Err(CompileError::Invalid(errors)) = result else {
            panic!("expected the topology to be rejected");
        };
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], ValidationError::DanglingEndpoint { node, .. } if &**node == "h3"));
        assert!(errors[0].to_string().contains("h3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_scenario_applies_immediately() {
        let testbed = testbed()
            .scenarios(
                r#"
scenarios:
  persistent:
    - id: lossy-uplink
      applies_to: "link:h1->r1"
      impairments: { loss: 1% }
"#,
            )
            .call()
            .await;
        let scheduler = testbed.instance.scheduler();
        let interface = testbed.driver.interface("h1", "r1").unwrap();

        assert_eq!(scheduler.state("lossy-uplink"), Some(ScenarioState::Applied));
        let applied = testbed.driver.impairment_of(&interface).unwrap();
        assert_eq!(applied.tc_commands(&interface.name).len(), 1);

        scheduler.remove_scenario("lossy-uplink").await.unwrap();
        assert_eq!(
            testbed.instance.engine().state(&interface),
            ImpairmentState::Cleared
        );
        assert_eq!(testbed.driver.impairment_of(&interface), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_scenario_runs_for_its_duration() {
        let testbed = testbed()
            .scenarios(
                r#"
scenarios:
  transient:
    - id: congestion
      applies_to: "path:h1->r1->h2"
      netem: { delay: 100ms }
      duration: PT1M
"#,
            )
            .call()
            .await;
        let scheduler = testbed.instance.scheduler();

        // No schedule: it only runs when triggered
        assert_eq!(scheduler.state("congestion"), Some(ScenarioState::Registered));

        let TriggerOutcome::Activated(instance) = scheduler.trigger("congestion").await.unwrap()
        else {
            panic!("expected the scenario to be activated");
        };
        assert_eq!(instance.end_time - instance.start_time, TimeDelta::seconds(60));
        assert_eq!(scheduler.state("congestion"), Some(ScenarioState::Active));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(scheduler.state("congestion"), Some(ScenarioState::Registered));
        assert!(
            testbed
                .instance
                .engine()
                .snapshot()
                .values()
                .all(|state| *state == ImpairmentState::Cleared)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers() {
        let testbed = testbed()
            .scenarios(
                r#"
scenarios:
  transient:
    - id: flap
      applies_to: "node:r1"
      netem: { loss: 100 }
      duration: 30
"#,
            )
            .call()
            .await;
        let scheduler = testbed.instance.scheduler();

        let (first, second) = tokio::join!(scheduler.trigger("flap"), scheduler.trigger("flap"));
        let activations = [first.unwrap(), second.unwrap()]
            .into_iter()
            .filter(|outcome| matches!(outcome, TriggerOutcome::Activated(_)))
            .count();

        assert_eq!(activations, 1);
        assert_eq!(scheduler.active_instances().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_nothing_behind() {
        let testbed = testbed()
            .scenarios(
                r#"
scenarios:
  persistent:
    - id: slow-core
      applies_to: "node:r1"
      netem: { delay: 20ms }
"#,
            )
            .call()
            .await;
        let events = testbed.instance.events().clone();
        let interface = testbed.driver.interface("r1", "h2").unwrap();
        assert!(testbed.driver.impairment_of(&interface).is_some());

        testbed.instance.shutdown().await;
        assert_eq!(testbed.driver.impairment_of(&interface), None);
        assert_eq!(events.of_kind(EventKind::TopologyDeleted).len(), 1);
    }
}
