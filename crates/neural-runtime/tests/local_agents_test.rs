//! Integration tests for agents sharing an in-process bus.
//!
//! Three agents register on one `LocalTransport` and share one synapse
//! table, the way a single process hosts several agents. Everything runs on
//! real tokio tasks; nothing leaves the process.

use neural_runtime::{Agent, AgentState, HandlerRegistry, SynapseTable};
use neural_types::config::{AgentConfig, NeuralConfig, SynapseConfig};
use neural_types::{payload, Identity, Signal, SignalType};
use neural_wire::{LocalTransport, Transport};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn shared_table() -> Arc<SynapseTable> {
    Arc::new(SynapseTable::new(SynapseConfig::default()).unwrap())
}

/// Handlers that record every payload they see.
fn recorder(signal_type: SignalType) -> (HandlerRegistry, Arc<Mutex<Vec<Signal>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    let sink = seen.clone();
    handlers.on_fn(signal_type, move |signal| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(signal);
            Ok(())
        }
    });
    (handlers, seen)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_request_reply_between_agents() {
    let bus = LocalTransport::new();
    let synapses = shared_table();

    // "support" answers every ACTION_POTENTIAL with a DOPAMINE to the sender.
    let support_id = Identity::derive("support", Some(b"it")).unwrap();
    let support_endpoint: Arc<dyn Transport> = Arc::new(bus.register("support", support_id).unwrap());
    let mut support_handlers = HandlerRegistry::new();
    {
        let reply = support_endpoint.clone();
        support_handlers.on_fn(SignalType::ActionPotential, move |signal| {
            let reply = reply.clone();
            async move {
                let answer = Signal::new(
                    SignalType::Dopamine,
                    support_id,
                    signal.source,
                    payload(json!({"ticket": signal.payload["ticket"], "status": "solved"})),
                );
                reply.send(&answer).await?;
                Ok(())
            }
        });
    }
    let support = Agent::new(
        "support",
        support_id,
        support_endpoint,
        synapses.clone(),
        support_handlers,
        AgentConfig::default(),
    );

    let (customer_handlers, answers) = recorder(SignalType::Dopamine);
    let customer = Agent::local(
        "customer",
        &bus,
        synapses.clone(),
        customer_handlers,
        AgentConfig::default(),
    )
    .unwrap();

    support.start().unwrap();
    customer.start().unwrap();

    for ticket in 0..3 {
        customer
            .transmit_to("support", SignalType::ActionPotential, payload(json!({"ticket": ticket})))
            .await
            .unwrap();
    }
    wait_until(|| answers.lock().unwrap().len() == 3).await;

    let tickets: Vec<_> = answers
        .lock()
        .unwrap()
        .iter()
        .map(|s| s.payload["ticket"].clone())
        .collect();
    assert_eq!(tickets, vec![json!(0), json!(1), json!(2)]);

    // The shared table sees each request twice: once when the customer's
    // transmit is delivered and once when support handles it.
    wait_until(|| support.health().dispatched == 3).await;
    let out = synapses.get(&customer.identity(), &support_id).unwrap();
    assert_eq!(out.transmissions, 6);
    assert_eq!(out.successes, 6);
    assert!(out.weight > 0.5);
    assert!(synapses.get_weight(&support_id, &customer.identity()) > 0.5);

    customer.stop().await;
    support.stop().await;
    assert_eq!(customer.state(), AgentState::Stopped);
}

#[tokio::test]
async fn test_broadcast_reaches_every_registered_agent() {
    let bus = LocalTransport::new();
    let synapses = shared_table();

    let mut agents = Vec::new();
    let mut inboxes = Vec::new();
    for name in ["billing", "sales", "support"] {
        let (handlers, seen) = recorder(SignalType::Gaba);
        let agent = Agent::local(name, &bus, synapses.clone(), handlers, AgentConfig::default()).unwrap();
        agent.start().unwrap();
        agents.push(agent);
        inboxes.push(seen);
    }

    // An endpoint that registers and leaves before the broadcast gets nothing.
    let gone = bus
        .register("gone", Identity::derive("gone", None).unwrap())
        .unwrap();
    gone.close().await;

    agents[0]
        .broadcast(SignalType::Gaba, payload(json!({"maintenance": true})))
        .await
        .unwrap();

    // Every registered agent, the sender included, receives one copy.
    wait_until(|| inboxes.iter().all(|seen| seen.lock().unwrap().len() == 1)).await;
    assert_eq!(bus.stats().delivered, 3);
    for seen in &inboxes {
        let signal = seen.lock().unwrap()[0].clone();
        assert!(signal.is_broadcast());
        assert_eq!(signal.source, agents[0].identity());
    }

    for agent in &agents {
        agent.stop().await;
    }
}

#[tokio::test]
async fn test_failing_handler_counts_against_sender_edge() {
    let bus = LocalTransport::new();
    let synapses = shared_table();

    let attempts = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    {
        let attempts = attempts.clone();
        handlers.on_fn(SignalType::Norepinephrine, move |_| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("billing system offline")
            }
        });
    }
    let billing = Agent::local("billing", &bus, synapses.clone(), handlers, AgentConfig::default()).unwrap();
    let sales = Agent::local("sales", &bus, synapses.clone(), HandlerRegistry::new(), AgentConfig::default()).unwrap();
    billing.start().unwrap();

    for _ in 0..5 {
        sales
            .transmit(billing.identity(), SignalType::Norepinephrine, payload(json!({"amount": 10})))
            .await
            .unwrap();
    }
    wait_until(|| billing.health().dispatched == 5).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    // Each signal lands on the sales -> billing edge twice: a successful
    // delivery, then a failed handling.
    let edge = synapses.get(&sales.identity(), &billing.identity()).unwrap();
    assert_eq!(edge.transmissions, 10);
    assert_eq!(edge.successes, 5);
    assert!(synapses.get(&billing.identity(), &sales.identity()).is_none());
    let health = billing.health();
    assert_eq!(health.handler_failures, 5);
    assert!(health.last_error.unwrap().contains("billing system offline"));

    billing.stop().await;
}

#[tokio::test]
async fn test_connect_transport_from_config() {
    let bus = LocalTransport::new();
    let config = NeuralConfig::default();
    let (transport, identity) = neural_runtime::connect_transport(&config, "router", &bus).unwrap();

    assert_eq!(bus.resolve("router"), Some(identity));
    bus.send(&Signal::new(
        SignalType::Serotonin,
        identity,
        identity,
        payload(json!({"self": true})),
    ))
    .unwrap();
    assert_eq!(transport.receive().await.unwrap().payload["self"], json!(true));
}
