//! Cluster de dos nodos en el mismo proceso, hablando por HTTP.

use common::api::{Context, Mapper, PluginRegistry};
use common::policy::{BootstrapPolicy, TransferPolicy};
use common::wordcount::WordCountMapper;
use common::{JobDescriptor, JobId, JobStatus, NodeId, Phase, State};
use node::config::PeerConfig;
use node::cpu::FixedCpuProbe;
use node::{Node, NodeConfig, NodeService, RemoteNode};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// WordCount con una pausa por línea, para que la cola tarde en vaciarse.
struct SlowWordCount;

impl Mapper for SlowWordCount {
    fn map(&mut self, key: &str, value: &str, ctx: &mut dyn Context) -> anyhow::Result<()> {
        std::thread::sleep(Duration::from_millis(300));
        WordCountMapper.map(key, value, ctx)
    }
}

fn plugins() -> PluginRegistry {
    let mut plugins = PluginRegistry::with_builtins();
    plugins.register_mapper("wordcount-lento", || SlowWordCount);
    plugins
}

struct TestNode {
    node: Arc<Node>,
    addr: String,
    _dir: tempfile::TempDir,
}

async fn start_cluster(bootstrap: BootstrapPolicy, transfer: TransferPolicy) -> Vec<TestNode> {
    let mut listeners = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        listeners.push((listener, addr));
    }

    let mut nodes = Vec::new();
    for (i, (listener, addr)) in listeners.iter().enumerate() {
        let id = NodeId(i as u32 + 1);
        let peers = listeners
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, (_, peer_addr))| PeerConfig {
                id: NodeId(j as u32 + 1),
                addr: peer_addr.clone(),
            })
            .collect();
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            node_id: id,
            port: listener.local_addr().unwrap().port(),
            peers,
            fs_root_dir: Some(dir.path().to_path_buf()),
            te_status_update_interval_ms: 50,
            lb_status_update_interval_ms: 50,
            lb_bootstrap_policy: bootstrap,
            lb_transfer_policy: transfer,
            ..Default::default()
        };
        let node = Node::new(config, plugins(), Arc::new(FixedCpuProbe(10.0)));
        nodes.push(TestNode {
            node,
            addr: addr.clone(),
            _dir: dir,
        });
    }

    for (test_node, (listener, _)) in nodes.iter().zip(listeners) {
        let node = test_node.node.clone();
        tokio::spawn(async move { node.serve(listener).await });
    }
    nodes
}

fn package(mapper: &str) -> Vec<u8> {
    let mut descriptor = JobDescriptor {
        mapper: mapper.into(),
        combiner: Some("wordcount".into()),
        reducer: "wordcount".into(),
        input_format: "text".into(),
        output_format: "text".into(),
        properties: Default::default(),
    };
    descriptor
        .properties
        .insert("text.input.format.lines.per.split".into(), "1".into());
    descriptor.to_package()
}

async fn wait_until_done(client: &RemoteNode, id: JobId) -> JobStatus {
    for _ in 0..400 {
        let status = client.job_status(id).await.unwrap();
        if status.state().is_end_state() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("el job {} no terminó a tiempo", id.qualified());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wordcount_runs_across_two_nodes() {
    let nodes = start_cluster(BootstrapPolicy::RoundRobin, TransferPolicy::Never).await;
    let client = RemoteNode::new(&nodes[0].addr);

    let input = "hola mundo\nhola\nmundo hola\nadios\n";
    let id = client
        .submit_job(package("wordcount"), input.as_bytes().to_vec())
        .await
        .unwrap();
    assert_eq!(id.node, NodeId(1));

    let status = wait_until_done(&client, id).await;
    assert_eq!(status.state(), State::Succeeded);
    assert_eq!(status.phase(), Phase::Reduce);

    // round robin: splits alternados entre los dos nodos
    let targets: Vec<NodeId> = status
        .map_tasks
        .iter()
        .map(|t| t.attempts[0].target)
        .collect();
    assert_eq!(targets, vec![NodeId(1), NodeId(2), NodeId(1), NodeId(2)]);
    assert_eq!(status.reduce_tasks[0].inputs.len(), 4);

    let second = RemoteNode::new(&nodes[1].addr);
    let jar = format!("{}/job.jar", id.qualified());
    assert!(second.exists(&jar).await.unwrap());

    let result = client
        .read(&format!("{}/output/result", id.qualified()))
        .await
        .unwrap();
    assert_eq!(
        String::from_utf8(result).unwrap(),
        "adios,1\nhola,3\nmundo,2\n"
    );

    assert_eq!(client.job_ids().await.unwrap(), vec![id]);

    for n in &nodes {
        RemoteNode::new(&n.addr).stop_node().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peers_answer_with_their_own_id_and_reject_bad_throttle() {
    let nodes = start_cluster(BootstrapPolicy::RoundRobin, TransferPolicy::Never).await;
    let second = RemoteNode::new(&nodes[1].addr);
    assert_eq!(second.node_id().await.unwrap(), NodeId(2));

    let err = second.set_throttle(120.0).await.unwrap_err();
    assert!(err.to_string().contains("400"));
    second.set_throttle(50.0).await.unwrap();
    assert_eq!(nodes[1].node.executor().throttle(), 50.0);

    for n in &nodes {
        n.node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_node_takes_over_queued_map_tasks() {
    // los splits quedan todos en el nodo 1; el nodo 2 ocioso dispara la migración
    let nodes = start_cluster(BootstrapPolicy::Local, TransferPolicy::Idle).await;
    let client = RemoteNode::new(&nodes[0].addr);

    let input = "uno\ndos\nuno\ntres\ndos\nuno\n";
    let id = client
        .submit_job(package("wordcount-lento"), input.as_bytes().to_vec())
        .await
        .unwrap();

    let status = wait_until_done(&client, id).await;
    assert_eq!(status.state(), State::Succeeded);
    assert!(status.map_tasks.iter().all(|t| t.state() == State::Succeeded));

    let attempts: Vec<_> = status
        .map_tasks
        .iter()
        .flat_map(|t| t.attempts.iter())
        .collect();
    assert!(status.map_tasks.iter().all(|t| t.attempts[0].target == NodeId(1)));
    assert!(
        attempts
            .iter()
            .any(|a| a.target == NodeId(2) && a.state() == State::Succeeded),
        "ningún attempt migrado terminó en el nodo 2"
    );
    // el original de una tarea migrada se canceló en el executor del nodo 1
    assert!(attempts
        .iter()
        .any(|a| a.target == NodeId(1) && a.state() == State::Canceled));

    // el paquete llegó al nodo 2 sólo por la migración
    let second = RemoteNode::new(&nodes[1].addr);
    assert!(second.exists(&format!("{}/job.jar", id.qualified())).await.unwrap());

    let result = client
        .read(&format!("{}/output/result", id.qualified()))
        .await
        .unwrap();
    assert_eq!(String::from_utf8(result).unwrap(), "dos,2\ntres,1\nuno,3\n");

    for n in &nodes {
        n.node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_submission_carries_raw_input_bytes() {
    let nodes = start_cluster(BootstrapPolicy::Local, TransferPolicy::Never).await;
    let client = RemoteNode::new(&nodes[0].addr);

    let id = client
        .submit_job(package("wordcount"), vec![0xff, b'\n'])
        .await
        .unwrap();
    let split = client
        .read(&format!("{}/input/split-00000", id.qualified()))
        .await
        .unwrap();
    assert_eq!(split, vec![0xff, b'\n']);

    for n in &nodes {
        n.node.stop();
    }
}
