/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#[cfg(test)]
mod tests {
    use crate::agent::{AgentCommand, AgentHandle, AgentPhase, AgentSession};
    use crate::broker::{Broker, BrokerError};
    use crate::client::{ClientPhase, ClientSession};
    use crate::scheduler::{Assignment, MockScheduler, QueueScheduler, Scheduler};
    use entity::*;
    use kiln_core::messages::*;
    use kiln_core::storage;
    use kiln_core::types::*;
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    type Agent = AgentSession<mpsc::UnboundedSender<AgentOutbound>>;
    type Client = ClientSession<mpsc::UnboundedSender<ClientOutbound>>;

    fn create_mock_cli(root: &Path) -> Cli {
        Cli {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            ip: "127.0.0.1".to_string(),
            port: 8000,
            builds_dir: root.to_path_buf(),
            keep: 0,
            dispatch_interval: 1,
            cancel_orphaned_requests: false,
            log_history: 500,
            key: None,
            cert: None,
        }
    }

    fn create_mock_state(root: &Path) -> Arc<ServerState> {
        Arc::new(ServerState {
            cli: create_mock_cli(root),
        })
    }

    fn create_broker(dir: &TempDir) -> (Arc<Broker>, Arc<QueueScheduler>) {
        let scheduler = Arc::new(QueueScheduler::new());
        let broker = Arc::new(Broker::new(
            create_mock_state(dir.path()),
            scheduler.clone(),
        ));
        (broker, scheduler)
    }

    async fn register_agent(
        broker: &Arc<Broker>,
        aid: &str,
        platform: &str,
    ) -> (
        Agent,
        mpsc::UnboundedReceiver<AgentCommand>,
        mpsc::UnboundedReceiver<AgentOutbound>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (mut session, commands) = AgentSession::new(Arc::clone(broker), tx);
        session
            .handle_message(AgentInbound::Register {
                aid: aid.to_string(),
                platform: platform.to_string(),
                name: None,
            })
            .await;
        (session, commands, rx)
    }

    fn connect_client(broker: &Arc<Broker>) -> (Client, mpsc::UnboundedReceiver<ClientOutbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientSession::new(Arc::clone(broker), tx), rx)
    }

    /// Registers a request without a client and queues its builds.
    async fn submit(broker: &Arc<Broker>, brid: &str, platforms: &[&str]) -> Arc<BuildRequest> {
        let platforms: Vec<String> = platforms.iter().map(|p| p.to_string()).collect();
        let request = Arc::new(BuildRequest::new(brid, &platforms, false, None));
        broker
            .add_build_request(Arc::clone(&request))
            .await
            .unwrap();
        broker
            .update_request(&request, RequestEvent::InputsReceived)
            .await
            .unwrap();
        for build in request.builds() {
            broker.add_build(&build).await;
        }
        request
    }

    /// Dispatches and lets the agent take the hire and accept its inputs.
    async fn hire_and_start(
        broker: &Arc<Broker>,
        agent: &mut Agent,
        commands: &mut mpsc::UnboundedReceiver<AgentCommand>,
        to_agent: &mut mpsc::UnboundedReceiver<AgentOutbound>,
    ) -> String {
        assert_eq!(broker.dispatch().await, 1);
        agent.handle_command(commands.try_recv().unwrap()).await;

        let bid = match to_agent.try_recv().unwrap() {
            AgentOutbound::Hire { bid, .. } => bid,
            other => panic!("expected hire, got {:?}", other),
        };

        agent
            .handle_message(AgentInbound::Accept {
                bid: Some(bid.clone()),
            })
            .await;
        while let Ok(message) = to_agent.try_recv() {
            assert!(matches!(message, AgentOutbound::Transfer { .. }));
        }

        bid
    }

    fn meta(basename: &str) -> FileMeta {
        FileMeta {
            basename: basename.to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_builder() {
        let dir = tempfile::tempdir().unwrap();
        let broker = crate::start_builder(create_mock_state(dir.path()))
            .await
            .unwrap();

        assert!(broker.requests().is_empty());
        assert!(broker.agents().is_empty());
    }

    #[test]
    fn test_queue_scheduler_matches_platform() {
        let scheduler = QueueScheduler::new();
        let (commands, _rx) = mpsc::unbounded_channel();
        let agent = AgentHandle::new("a1", "linux", None, Arc::new(AtomicBool::new(false)), commands);
        scheduler.add_target(agent.clone());

        let mac = Arc::new(Build::new("r1", "mac"));
        let linux = Arc::new(Build::new("r2", "linux"));
        mac.apply(BuildEvent::Enqueue).unwrap();
        linux.apply(BuildEvent::Enqueue).unwrap();
        scheduler.add(Arc::clone(&mac));
        scheduler.add(Arc::clone(&linux));

        let assignments = scheduler.assign();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].build.bid(), "linux:r2");
        assert!(agent.is_assigned());
        assert_eq!(scheduler.queued(), vec!["mac:r1".to_string()]);
        assert_eq!(
            scheduler.supported_platforms(),
            BTreeSet::from(["linux".to_string()])
        );
    }

    #[test]
    fn test_queue_scheduler_assigns_agent_once() {
        let scheduler = QueueScheduler::new();
        let (commands, _rx) = mpsc::unbounded_channel();
        let agent = AgentHandle::new("a1", "linux", None, Arc::new(AtomicBool::new(false)), commands);
        scheduler.add_target(agent);

        for brid in ["r1", "r2"] {
            let build = Arc::new(Build::new(brid, "linux"));
            build.apply(BuildEvent::Enqueue).unwrap();
            scheduler.add(build);
        }

        assert_eq!(scheduler.assign().len(), 1);
        assert!(scheduler.assign().is_empty());
        assert_eq!(scheduler.queued(), vec!["linux:r2".to_string()]);
    }

    #[test]
    fn test_queue_scheduler_ignores_duplicates_and_stale_entries() {
        let scheduler = QueueScheduler::new();
        let build = Arc::new(Build::new("r1", "linux"));
        build.apply(BuildEvent::Enqueue).unwrap();

        scheduler.add(Arc::clone(&build));
        scheduler.add(Arc::clone(&build));
        assert_eq!(scheduler.queued().len(), 1);

        build.apply(BuildEvent::Cancel).unwrap();
        assert!(scheduler.assign().is_empty());
        assert!(scheduler.queued().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_returns_build_when_agent_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let (commands, receiver) = mpsc::unbounded_channel();
        drop(receiver);

        let handle = AgentHandle::new("a1", "linux", None, Arc::new(AtomicBool::new(true)), commands);
        let build = Arc::new(Build::new("r1", "linux"));

        let mut scheduler = MockScheduler::new();
        let assignment = Assignment {
            agent: handle.clone(),
            build: Arc::clone(&build),
        };
        scheduler
            .expect_assign()
            .times(1)
            .returning(move || vec![assignment.clone()]);
        scheduler
            .expect_remove_target()
            .withf(|agent| agent.aid() == "a1")
            .times(1)
            .return_const(());
        scheduler
            .expect_add()
            .withf(|build| build.bid() == "linux:r1")
            .times(1)
            .return_const(());

        let broker = Broker::new(create_mock_state(dir.path()), Arc::new(scheduler));
        assert_eq!(broker.dispatch().await, 0);
        assert!(!handle.is_assigned());
    }

    #[tokio::test]
    async fn test_supported_platforms_come_from_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = MockScheduler::new();
        scheduler
            .expect_supported_platforms()
            .returning(|| BTreeSet::from(["linux".to_string(), "mac".to_string()]));

        let broker = Broker::new(create_mock_state(dir.path()), Arc::new(scheduler));
        assert_eq!(broker.supported_platforms().len(), 2);
    }

    #[tokio::test]
    async fn test_full_build_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        let (mut client, mut to_client) = connect_client(&broker);

        client
            .handle_message(ClientInbound::Register {
                cid: "c1".to_string(),
            })
            .await;
        client
            .handle_message(ClientInbound::Request {
                brid: "r1".to_string(),
                save: true,
                platforms: vec!["linux".to_string()],
                count: 1,
            })
            .await;
        assert_eq!(
            to_client.try_recv().unwrap(),
            ClientOutbound::Accept {
                brid: "r1".to_string()
            }
        );
        assert_eq!(client.phase(), ClientPhase::Uploading);

        client
            .handle_message(ClientInbound::Upload {
                brid: "r1".to_string(),
                platform: None,
                meta: meta("main.c"),
                data: Payload(b"int main() { return 0; }".to_vec()),
            })
            .await;

        let request = broker.get_build_request("r1").unwrap();
        let build = broker.get_build("linux:r1").unwrap();
        assert_eq!(request.status(), BuildRequestStatus::Processing);
        assert_eq!(request.client(), Some("c1"));
        assert_eq!(build.status(), BuildStatus::Queued);
        assert!(dir.path().join("r1/in/main.c").exists());

        assert_eq!(broker.dispatch().await, 1);
        agent.handle_command(commands.try_recv().unwrap()).await;
        assert_eq!(
            to_agent.try_recv().unwrap(),
            AgentOutbound::Hire {
                bid: "linux:r1".to_string(),
                count: 1
            }
        );
        assert_eq!(build.status(), BuildStatus::Transferring);
        assert_eq!(build.agent().as_deref(), Some("a1"));
        assert!(to_agent.try_recv().is_err());

        agent
            .handle_message(AgentInbound::Accept {
                bid: Some("linux:r1".to_string()),
            })
            .await;
        match to_agent.try_recv().unwrap() {
            AgentOutbound::Transfer { bid, meta, data } => {
                assert_eq!(bid, "linux:r1");
                assert_eq!(meta.basename, "main.c");
                assert_eq!(data.0, b"int main() { return 0; }".to_vec());
            }
            other => panic!("expected transfer, got {:?}", other),
        }
        assert_eq!(build.status(), BuildStatus::Building);

        agent
            .handle_message(AgentInbound::Conclude {
                bid: "linux:r1".to_string(),
                count: 1,
            })
            .await;
        assert_eq!(
            to_agent.try_recv().unwrap(),
            AgentOutbound::Accept {
                bid: "linux:r1".to_string()
            }
        );
        assert_eq!(build.status(), BuildStatus::Collecting);

        agent
            .handle_message(AgentInbound::Serve {
                bid: "linux:r1".to_string(),
                meta: meta("out.bin"),
                data: Payload(vec![0x7f, b'E', b'L', b'F']),
            })
            .await;
        assert_eq!(
            to_agent.try_recv().unwrap(),
            AgentOutbound::Confirm {
                bid: "linux:r1".to_string()
            }
        );
        assert_eq!(build.status(), BuildStatus::Success);
        assert_eq!(request.status(), BuildRequestStatus::Finished);
        assert_eq!(agent.phase(), AgentPhase::Idle);
        assert!(!agent.is_assigned());
        assert!(dir.path().join("r1/out/linux/out.bin").exists());

        client.handle_status(request.status()).await;
        assert_eq!(
            to_client.try_recv().unwrap(),
            ClientOutbound::Conclude {
                brid: "r1".to_string(),
                count: 1
            }
        );

        client
            .handle_message(ClientInbound::Accept {
                brid: "r1".to_string(),
            })
            .await;
        match to_client.try_recv().unwrap() {
            ClientOutbound::Serve { brid, meta, data } => {
                assert_eq!(brid, "r1");
                assert_eq!(meta.basename, "out.bin");
                assert_eq!(data.0, vec![0x7f, b'E', b'L', b'F']);
            }
            other => panic!("expected serve, got {:?}", other),
        }
        assert_eq!(request.status(), BuildRequestStatus::Delivered);
        assert!(dir.path().join("r1/build.json").exists());
    }

    #[tokio::test]
    async fn test_agent_serve_before_accept_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        submit(&broker, "r1", &["linux"]).await;
        let bid = hire_and_start(&broker, &mut agent, &mut commands, &mut to_agent).await;

        agent
            .handle_message(AgentInbound::Serve {
                bid: bid.clone(),
                meta: meta("out.bin"),
                data: Payload(b"early".to_vec()),
            })
            .await;

        assert!(to_agent.try_recv().is_err());
        assert!(!dir.path().join("r1/out/linux/out.bin").exists());
        assert_eq!(broker.get_build(&bid).unwrap().status(), BuildStatus::Building);
    }

    #[tokio::test]
    async fn test_agent_completes_after_exact_count() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        submit(&broker, "r1", &["linux"]).await;
        let bid = hire_and_start(&broker, &mut agent, &mut commands, &mut to_agent).await;
        let build = broker.get_build(&bid).unwrap();

        agent
            .handle_message(AgentInbound::Conclude {
                bid: bid.clone(),
                count: 2,
            })
            .await;
        to_agent.try_recv().unwrap();

        agent
            .handle_message(AgentInbound::Serve {
                bid: bid.clone(),
                meta: meta("a.out"),
                data: Payload(b"a".to_vec()),
            })
            .await;
        assert_eq!(build.status(), BuildStatus::Collecting);

        agent
            .handle_message(AgentInbound::Serve {
                bid: bid.clone(),
                meta: meta("b.out"),
                data: Payload(b"b".to_vec()),
            })
            .await;
        assert_eq!(build.status(), BuildStatus::Success);
        assert_eq!(build.artifacts().len(), 2);

        agent
            .handle_message(AgentInbound::Serve {
                bid: bid.clone(),
                meta: meta("c.out"),
                data: Payload(b"c".to_vec()),
            })
            .await;
        assert_eq!(build.artifacts().len(), 2);
        assert!(!dir.path().join("r1/out/linux/c.out").exists());
    }

    #[tokio::test]
    async fn test_agent_conclude_without_artifacts_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        let request = submit(&broker, "r1", &["linux"]).await;
        let bid = hire_and_start(&broker, &mut agent, &mut commands, &mut to_agent).await;

        agent
            .handle_message(AgentInbound::Conclude {
                bid: bid.clone(),
                count: 0,
            })
            .await;

        assert_eq!(broker.get_build(&bid).unwrap().status(), BuildStatus::Success);
        assert_eq!(request.status(), BuildRequestStatus::Finished);
        assert_eq!(agent.phase(), AgentPhase::Idle);
    }

    #[tokio::test]
    async fn test_agent_fail_finishes_request() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        let request = submit(&broker, "r1", &["linux"]).await;
        let bid = hire_and_start(&broker, &mut agent, &mut commands, &mut to_agent).await;

        agent
            .handle_message(AgentInbound::Fail {
                bid: "linux:other".to_string(),
                error: None,
            })
            .await;
        assert_eq!(broker.get_build(&bid).unwrap().status(), BuildStatus::Building);

        agent
            .handle_message(AgentInbound::Fail {
                bid: bid.clone(),
                error: Some("cc: exit status 1".to_string()),
            })
            .await;

        let build = broker.get_build(&bid).unwrap();
        assert_eq!(build.status(), BuildStatus::Failed);
        assert!(build.logs().iter().any(|line| line == "cc: exit status 1"));
        assert_eq!(request.status(), BuildRequestStatus::Failed);
        assert!(!agent.is_assigned());
    }

    #[tokio::test]
    async fn test_agent_disconnect_requeues_once() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, scheduler) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        submit(&broker, "r1", &["linux"]).await;
        let bid = hire_and_start(&broker, &mut agent, &mut commands, &mut to_agent).await;

        agent.disconnect().await;
        agent.disconnect().await;

        let build = broker.get_build(&bid).unwrap();
        assert_eq!(build.status(), BuildStatus::Queued);
        assert_eq!(build.agent(), None);
        assert_eq!(scheduler.queued(), vec![bid]);
        assert!(broker.agents().is_empty());
        assert!(broker.supported_platforms().is_empty());
    }

    #[tokio::test]
    async fn test_agent_register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut agent, _commands, _to_agent) = register_agent(&broker, "a1", "linux").await;

        agent
            .handle_message(AgentInbound::Register {
                aid: "a1".to_string(),
                platform: "linux".to_string(),
                name: Some("builder-01".to_string()),
            })
            .await;

        let agents = broker.agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name.as_deref(), Some("builder-01"));
        assert_eq!(agent.phase(), AgentPhase::Idle);
    }

    #[tokio::test]
    async fn test_cancel_running_build_notifies_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        let request = submit(&broker, "r1", &["linux"]).await;
        let bid = hire_and_start(&broker, &mut agent, &mut commands, &mut to_agent).await;

        assert_ok!(broker.cancel(&bid).await);
        assert_eq!(broker.get_build(&bid).unwrap().status(), BuildStatus::Cancelled);
        assert_eq!(request.status(), BuildRequestStatus::Cancelled);

        agent.handle_command(commands.try_recv().unwrap()).await;
        assert_eq!(
            to_agent.try_recv().unwrap(),
            AgentOutbound::Cancel { bid: bid.clone() }
        );
        assert_eq!(agent.phase(), AgentPhase::Idle);
        assert!(!agent.is_assigned());
    }

    #[tokio::test]
    async fn test_cancel_and_rebuild_request() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, scheduler) = create_broker(&dir);
        let request = submit(&broker, "r1", &["linux", "mac"]).await;

        assert_ok!(broker.cancel("r1").await);
        assert_eq!(request.status(), BuildRequestStatus::Cancelled);
        assert!(
            request
                .builds()
                .iter()
                .all(|build| build.status() == BuildStatus::Cancelled)
        );
        assert!(scheduler.queued().is_empty());

        assert_ok!(broker.rebuild("r1").await);
        assert_eq!(request.status(), BuildRequestStatus::Processing);
        assert_eq!(scheduler.queued().len(), 2);

        assert!(matches!(
            broker.cancel("missing").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_autodetect_expands_to_supported_platforms() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let _linux = register_agent(&broker, "a1", "linux").await;
        let _mac = register_agent(&broker, "a2", "mac").await;
        let (mut client, mut to_client) = connect_client(&broker);

        client
            .handle_message(ClientInbound::Request {
                brid: "r1".to_string(),
                save: false,
                platforms: vec!["autodetect".to_string()],
                count: 0,
            })
            .await;

        assert!(matches!(
            to_client.try_recv().unwrap(),
            ClientOutbound::Accept { .. }
        ));
        let request = broker.get_build_request("r1").unwrap();
        assert_eq!(request.builds().len(), 2);
        assert!(broker.get_build("linux:r1").is_some());
        assert!(broker.get_build("mac:r1").is_some());
        assert_eq!(request.status(), BuildRequestStatus::Processing);
    }

    #[tokio::test]
    async fn test_platform_tagged_inputs_reach_matching_build() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut client, _to_client) = connect_client(&broker);

        client
            .handle_message(ClientInbound::Request {
                brid: "r1".to_string(),
                save: false,
                platforms: vec!["linux".to_string(), "mac".to_string()],
                count: 2,
            })
            .await;
        client
            .handle_message(ClientInbound::Upload {
                brid: "r1".to_string(),
                platform: None,
                meta: meta("main.c"),
                data: Payload(b"shared".to_vec()),
            })
            .await;
        client
            .handle_message(ClientInbound::Upload {
                brid: "r1".to_string(),
                platform: Some("mac".to_string()),
                meta: meta("mac.h"),
                data: Payload(b"mac only".to_vec()),
            })
            .await;

        let linux = broker.get_build("linux:r1").unwrap();
        let mac = broker.get_build("mac:r1").unwrap();
        assert_eq!(linux.inputs().len(), 1);
        assert_eq!(mac.inputs().len(), 2);
        assert_eq!(linux.status(), BuildStatus::Queued);
    }

    #[tokio::test]
    async fn test_client_rejects_unsafe_names() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut client, mut to_client) = connect_client(&broker);

        client
            .handle_message(ClientInbound::Request {
                brid: "../r1".to_string(),
                save: false,
                platforms: vec!["linux".to_string()],
                count: 1,
            })
            .await;
        assert!(matches!(
            to_client.try_recv().unwrap(),
            ClientOutbound::Failed { .. }
        ));
        assert!(broker.requests().is_empty());

        client
            .handle_message(ClientInbound::Request {
                brid: "r1".to_string(),
                save: false,
                platforms: vec!["linux".to_string()],
                count: 1,
            })
            .await;
        to_client.try_recv().unwrap();
        client
            .handle_message(ClientInbound::Upload {
                brid: "r1".to_string(),
                platform: None,
                meta: meta("../escape"),
                data: Payload(b"x".to_vec()),
            })
            .await;

        assert_eq!(
            broker.get_build_request("r1").unwrap().status(),
            BuildRequestStatus::Failed
        );
        assert!(!dir.path().join("escape").exists());
        assert!(!dir.path().join("r1/escape").exists());
    }

    #[tokio::test]
    async fn test_client_upload_before_request_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut client, mut to_client) = connect_client(&broker);

        client
            .handle_message(ClientInbound::Upload {
                brid: "r1".to_string(),
                platform: None,
                meta: meta("main.c"),
                data: Payload(b"x".to_vec()),
            })
            .await;

        assert!(to_client.try_recv().is_err());
        assert!(!dir.path().join("r1").exists());
    }

    #[tokio::test]
    async fn test_client_second_request_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut client, mut to_client) = connect_client(&broker);

        for brid in ["r1", "r2"] {
            client
                .handle_message(ClientInbound::Request {
                    brid: brid.to_string(),
                    save: false,
                    platforms: vec!["linux".to_string()],
                    count: 1,
                })
                .await;
        }

        assert!(matches!(
            to_client.try_recv().unwrap(),
            ClientOutbound::Accept { .. }
        ));
        assert_eq!(
            to_client.try_recv().unwrap(),
            ClientOutbound::Failed {
                brid: "r2".to_string(),
                status: BuildRequestStatus::Failed
            }
        );
        assert!(broker.get_build_request("r2").is_none());
    }

    #[tokio::test]
    async fn test_client_error_fails_request() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut client, mut to_client) = connect_client(&broker);

        client
            .handle_message(ClientInbound::Request {
                brid: "r1".to_string(),
                save: true,
                platforms: vec!["linux".to_string()],
                count: 0,
            })
            .await;
        to_client.try_recv().unwrap();

        client
            .handle_message(ClientInbound::Error {
                brid: "r1".to_string(),
            })
            .await;
        let request = broker.get_build_request("r1").unwrap();
        assert_eq!(request.status(), BuildRequestStatus::Failed);

        client.handle_status(request.status()).await;
        assert_eq!(
            to_client.try_recv().unwrap(),
            ClientOutbound::Failed {
                brid: "r1".to_string(),
                status: BuildRequestStatus::Failed
            }
        );
        assert_eq!(client.phase(), ClientPhase::Done);
    }

    #[tokio::test]
    async fn test_client_disconnect_keeps_request_running() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut client, _to_client) = connect_client(&broker);

        client
            .handle_message(ClientInbound::Request {
                brid: "r1".to_string(),
                save: true,
                platforms: vec!["linux".to_string()],
                count: 0,
            })
            .await;
        client.disconnect().await;

        let request = broker.get_build_request("r1").unwrap();
        assert_eq!(request.status(), BuildRequestStatus::Processing);
        assert_eq!(
            broker.get_build("linux:r1").unwrap().status(),
            BuildStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_orphans_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = create_mock_cli(dir.path());
        cli.cancel_orphaned_requests = true;
        let broker = Arc::new(Broker::new(
            Arc::new(ServerState { cli }),
            Arc::new(QueueScheduler::new()),
        ));
        let (mut client, _to_client) = connect_client(&broker);

        client
            .handle_message(ClientInbound::Request {
                brid: "r1".to_string(),
                save: true,
                platforms: vec!["linux".to_string()],
                count: 0,
            })
            .await;
        client.disconnect().await;

        let request = broker.get_build_request("r1").unwrap();
        assert_eq!(request.status(), BuildRequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_client_run_reports_failure_from_status_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (client, mut to_client) = connect_client(&broker);
        let (inbound, stream) = futures::channel::mpsc::unbounded();
        let handle = tokio::spawn(client.run(stream));

        inbound
            .unbounded_send(ClientInbound::Request {
                brid: "r1".to_string(),
                save: false,
                platforms: vec![],
                count: 0,
            })
            .unwrap();

        assert_eq!(
            to_client.recv().await.unwrap(),
            ClientOutbound::Accept {
                brid: "r1".to_string()
            }
        );
        assert_eq!(
            to_client.recv().await.unwrap(),
            ClientOutbound::Failed {
                brid: "r1".to_string(),
                status: BuildRequestStatus::Failed
            }
        );

        drop(inbound);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        submit(&broker, "r1", &["linux"]).await;

        let again = Arc::new(BuildRequest::new("r1", &["linux".to_string()], false, None));
        assert!(matches!(
            broker.add_build_request(again).await,
            Err(BrokerError::DuplicateRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_keep_prunes_old_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = create_mock_cli(dir.path());
        cli.keep = 1;
        let broker = Arc::new(Broker::new(
            Arc::new(ServerState { cli }),
            Arc::new(QueueScheduler::new()),
        ));

        for brid in ["r1", "r2"] {
            submit(&broker, brid, &["linux"]).await;
            broker.cancel(brid).await.unwrap();
        }

        assert!(broker.get_build_request("r1").is_none());
        assert!(broker.get_build_request("r2").is_some());
        assert!(!dir.path().join("r1").exists());
        assert!(dir.path().join("r2/build.json").exists());
    }

    #[tokio::test]
    async fn test_load_previous_builds_marks_interrupted_work() {
        let dir = tempfile::tempdir().unwrap();

        let request = BuildRequest::new("r1", &["linux".to_string()], false, None);
        request.apply(RequestEvent::InputsReceived).unwrap();
        let build = request.builds()[0].clone();
        build.apply(BuildEvent::Enqueue).unwrap();
        build
            .apply(BuildEvent::Hire {
                agent: "a1".to_string(),
            })
            .unwrap();
        storage::write_manifest(dir.path(), &request.snapshot())
            .await
            .unwrap();

        let (broker, scheduler) = create_broker(&dir);
        assert_eq!(broker.load_previous_builds().await.unwrap(), 1);

        let restored = broker.get_build_request("r1").unwrap();
        assert_eq!(restored.status(), BuildRequestStatus::Failed);
        let build = broker.get_build("linux:r1").unwrap();
        assert_eq!(build.status(), BuildStatus::Failed);
        assert!(
            build
                .logs()
                .iter()
                .any(|line| line == "interrupted by broker restart")
        );
        assert!(scheduler.queued().is_empty());
    }

    #[tokio::test]
    async fn test_broker_log_is_bounded_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = create_mock_cli(dir.path());
        cli.log_history = 2;
        let broker = Broker::new(Arc::new(ServerState { cli }), Arc::new(QueueScheduler::new()));
        let mut news = broker.subscribe();

        broker.log("one");
        broker.log("two");
        broker.log("three");

        let logs: Vec<String> = broker.logs().into_iter().map(|line| line.message).collect();
        assert_eq!(logs, vec!["two".to_string(), "three".to_string()]);

        let first = news.recv().await.unwrap();
        assert_eq!(first.kind, "log");
        assert_eq!(first.obj["message"], "one");
    }

    #[tokio::test]
    async fn test_agent_disconnect_returns_unread_hire() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, scheduler) = create_broker(&dir);
        let (mut agent, mut commands, _to_agent) = register_agent(&broker, "a1", "linux").await;
        submit(&broker, "r1", &["linux"]).await;

        assert_eq!(broker.dispatch().await, 1);
        assert!(scheduler.queued().is_empty());

        agent.return_hires(&mut commands).await;
        agent.disconnect().await;

        let build = broker.get_build("linux:r1").unwrap();
        assert_eq!(build.status(), BuildStatus::Queued);
        assert_eq!(scheduler.queued(), vec!["linux:r1".to_string()]);
        assert!(broker.agents().is_empty());
    }

    #[tokio::test]
    async fn test_agent_run_requeues_hire_dispatched_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, scheduler) = create_broker(&dir);
        let (tx, _to_agent) = mpsc::unbounded_channel();
        let (agent, commands) = AgentSession::new(Arc::clone(&broker), tx);
        let (inbound, stream) = futures::channel::mpsc::unbounded();
        let handle = tokio::spawn(agent.run(stream, commands));

        inbound
            .unbounded_send(AgentInbound::Register {
                aid: "a1".to_string(),
                platform: "linux".to_string(),
                name: None,
            })
            .unwrap();
        while broker.agents().is_empty() {
            tokio::task::yield_now().await;
        }

        submit(&broker, "r1", &["linux"]).await;
        assert_eq!(broker.dispatch().await, 1);
        drop(inbound);
        handle.await.unwrap();

        assert_eq!(
            broker.get_build("linux:r1").unwrap().status(),
            BuildStatus::Queued
        );
        assert_eq!(scheduler.queued(), vec!["linux:r1".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_session_keeps_reconnected_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut stale, _stale_commands, _to_stale) = register_agent(&broker, "a1", "linux").await;
        let (_live, mut live_commands, _to_live) = register_agent(&broker, "a1", "linux").await;

        stale.disconnect().await;

        assert_eq!(broker.agents().len(), 1);
        assert_eq!(
            broker.supported_platforms(),
            BTreeSet::from(["linux".to_string()])
        );

        submit(&broker, "r1", &["linux"]).await;
        assert_eq!(broker.dispatch().await, 1);
        assert!(matches!(
            live_commands.try_recv().unwrap(),
            AgentCommand::Hire(build) if build.bid() == "linux:r1"
        ));
    }

    #[tokio::test]
    async fn test_agent_artifact_write_failure_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        let request = submit(&broker, "r1", &["linux"]).await;
        let bid = hire_and_start(&broker, &mut agent, &mut commands, &mut to_agent).await;
        std::fs::create_dir_all(dir.path().join("r1/out/linux/out.bin")).unwrap();

        agent
            .handle_message(AgentInbound::Conclude {
                bid: bid.clone(),
                count: 2,
            })
            .await;
        assert_eq!(
            to_agent.try_recv().unwrap(),
            AgentOutbound::Accept { bid: bid.clone() }
        );

        agent
            .handle_message(AgentInbound::Serve {
                bid: bid.clone(),
                meta: meta("out.bin"),
                data: Payload(b"first".to_vec()),
            })
            .await;

        let build = broker.get_build(&bid).unwrap();
        assert_eq!(build.status(), BuildStatus::Failed);
        assert_eq!(request.status(), BuildRequestStatus::Failed);
        assert_eq!(agent.phase(), AgentPhase::Idle);
        assert!(!agent.is_assigned());
        assert!(to_agent.try_recv().is_err());

        agent
            .handle_message(AgentInbound::Serve {
                bid: bid.clone(),
                meta: meta("second.bin"),
                data: Payload(b"second".to_vec()),
            })
            .await;
        assert!(!dir.path().join("r1/out/linux/second.bin").exists());
        assert!(build.artifacts().is_empty());
    }

    #[tokio::test]
    async fn test_delete_request_removes_registry_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, scheduler) = create_broker(&dir);
        let request = submit(&broker, "r1", &["linux"]).await;
        let input = storage::input_path(dir.path(), "r1", "main.c").unwrap();
        storage::write_file(&input, b"int main;").await.unwrap();

        assert_ok!(broker.delete("r1").await);

        assert_eq!(request.status(), BuildRequestStatus::Cancelled);
        assert!(broker.get_build_request("r1").is_none());
        assert!(broker.get_build("linux:r1").is_none());
        assert!(scheduler.queued().is_empty());
        assert!(!dir.path().join("r1").exists());
        assert!(matches!(
            broker.delete("r1").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_running_build_detaches_it_from_request() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, scheduler) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        let request = submit(&broker, "r1", &["linux", "mac"]).await;
        let bid = hire_and_start(&broker, &mut agent, &mut commands, &mut to_agent).await;

        assert_ok!(broker.delete(&bid).await);

        assert!(broker.get_build(&bid).is_none());
        assert_eq!(request.builds().len(), 1);
        assert_eq!(request.status(), BuildRequestStatus::Processing);
        assert_eq!(scheduler.queued(), vec!["mac:r1".to_string()]);

        agent.handle_command(commands.try_recv().unwrap()).await;
        assert_eq!(
            to_agent.try_recv().unwrap(),
            AgentOutbound::Cancel { bid: bid.clone() }
        );
        assert_eq!(agent.phase(), AgentPhase::Idle);
    }

    #[tokio::test]
    async fn test_agent_log_reaches_owning_client() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, scheduler) = create_broker(&dir);
        let (mut agent, mut commands, mut to_agent) = register_agent(&broker, "a1", "linux").await;
        let (client, mut to_client) = connect_client(&broker);
        let connection = client.connection().to_string();
        let (inbound, stream) = futures::channel::mpsc::unbounded();
        let handle = tokio::spawn(client.run(stream));

        inbound
            .unbounded_send(ClientInbound::Request {
                brid: "r1".to_string(),
                save: false,
                platforms: vec!["linux".to_string()],
                count: 0,
            })
            .unwrap();
        assert_eq!(
            to_client.recv().await.unwrap(),
            ClientOutbound::Accept {
                brid: "r1".to_string()
            }
        );

        while scheduler.queued().is_empty() {
            tokio::task::yield_now().await;
        }

        let clients = broker.snapshot().clients;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].connection, connection);
        assert_eq!(clients[0].brid.as_deref(), Some("r1"));

        let bid = hire_and_start(&broker, &mut agent, &mut commands, &mut to_agent).await;
        agent
            .handle_message(AgentInbound::Log {
                bid: Some(bid.clone()),
                message: "cc -o app main.c".to_string(),
            })
            .await;

        assert_eq!(
            to_client.recv().await.unwrap(),
            ClientOutbound::Log {
                brid: "r1".to_string(),
                bid,
                message: "cc -o app main.c".to_string()
            }
        );

        drop(inbound);
        handle.await.unwrap();
        assert!(broker.clients().is_empty());
    }
}
