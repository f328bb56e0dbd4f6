use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, StatusCode};

use tally::network::{ConnectivityMonitor, ConnectivityState, NetworkSignal};

async fn start_health_server(status: StatusCode) -> SocketAddr {
    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |_req| async move {
            let mut response = Response::new(Body::from("{}"));
            *response.status_mut() = status;
            Ok::<_, Infallible>(response)
        }))
    });

    let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    addr
}

#[tokio::test]
async fn connectivity_check_once_returns_true_for_healthy_server() {
    let addr = start_health_server(StatusCode::OK).await;
    let ok = ConnectivityMonitor::check_once(
        &format!("http://{addr}/health"),
        Duration::from_secs(2),
    )
    .await;
    assert!(ok, "expected ConnectivityMonitor to report healthy server");
}

#[tokio::test]
async fn connectivity_check_once_rejects_unhealthy_status() {
    let addr = start_health_server(StatusCode::SERVICE_UNAVAILABLE).await;
    let ok = ConnectivityMonitor::check_once(
        &format!("http://{addr}/health"),
        Duration::from_secs(2),
    )
    .await;
    assert!(!ok);
}

#[tokio::test]
async fn connectivity_check_once_returns_false_for_unreachable_target() {
    let ok = ConnectivityMonitor::check_once("http://127.0.0.1:1/health", Duration::from_secs(2))
        .await;
    assert!(
        !ok,
        "expected ConnectivityMonitor to report unreachable target as false"
    );
}

#[tokio::test]
async fn monitor_run_marks_signal_usable() {
    let addr = start_health_server(StatusCode::OK).await;
    let monitor = ConnectivityMonitor::new(
        format!("http://{addr}/health"),
        Duration::from_millis(50),
    );
    let mut usable = monitor.subscribe();
    assert!(!monitor.usable());

    let task = tokio::spawn(monitor.clone().run());

    tokio::time::timeout(Duration::from_secs(5), usable.changed())
        .await
        .expect("monitor should report within the timeout")
        .unwrap();
    assert!(*usable.borrow());
    assert_eq!(monitor.state(), ConnectivityState::Connected);

    task.abort();
}
