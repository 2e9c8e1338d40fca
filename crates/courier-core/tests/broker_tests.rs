//! Remoting across the TCP queue broker.

use std::sync::Arc;
use std::time::Duration;

use courier_core::broker::protocol::{
    decode_frame, encode_frame, read_frame, write_frame, ClientFrame, ServerFrame,
};
use courier_core::broker::{BrokerHandle, BrokerServer, BrokerTransport};
use courier_core::{
    BrokerOptions, CourierError, Remoting, ServiceDescriptor, ServiceRegistry, Transport,
};
use tokio::net::TcpStream;

struct Calculator;

impl Calculator {
    fn add(&self, a: i64, b: i64) -> i64 {
        a + b
    }
}

fn calculator_registry() -> ServiceRegistry {
    ServiceRegistry::builder()
        .register(
            ServiceDescriptor::shared("ICalculator", Arc::new(Calculator))
                .method("Add", |c: &Calculator, (a, b): (i64, i64)| {
                    Ok::<_, std::convert::Infallible>(c.add(a, b))
                })
                .build(),
        )
        .build()
}

async fn start_broker() -> BrokerHandle {
    BrokerServer::start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
}

async fn remoting(broker: &BrokerHandle, timeout: Duration) -> Remoting {
    let transport = BrokerTransport::connect(BrokerOptions::new(broker.addr()))
        .await
        .unwrap();
    Remoting::builder()
        .transport(transport)
        .timeout(timeout)
        .build()
        .unwrap()
}

async fn wait_for_consumers(broker: &BrokerHandle, queue: &str, count: usize) {
    for _ in 0..100 {
        if broker.consumer_count(queue) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Expected {} consumers on {}", count, queue);
}

#[tokio::test]
async fn test_call_through_broker() {
    let broker = start_broker().await;
    let receiver = remoting(&broker, Duration::from_secs(5)).await;
    let serving = receiver.serve(calculator_registry());

    let caller = remoting(&broker, Duration::from_secs(5)).await;
    let sum: i64 = caller
        .proxy("ICalculator")
        .invoke("Add", (2i64, 40i64))
        .await
        .unwrap();
    assert_eq!(sum, 42);

    let err = caller
        .proxy("ICalculator")
        .invoke::<_, i64>("Subtract", (2i64, 40i64))
        .await
        .unwrap_err();
    assert!(err.as_remote().unwrap().is_method_not_found());

    serving.stop().await.unwrap();
}

#[tokio::test]
async fn test_declined_request_reaches_owning_receiver() {
    let broker = start_broker().await;

    struct Other;
    let bystander = remoting(&broker, Duration::from_secs(5)).await.serve(
        ServiceRegistry::builder()
            .register(ServiceDescriptor::shared("IOther", Arc::new(Other)).build())
            .build(),
    );
    wait_for_consumers(&broker, "courier.requests", 1).await;

    let owner = remoting(&broker, Duration::from_secs(5)).await.serve(calculator_registry());
    wait_for_consumers(&broker, "courier.requests", 2).await;

    let caller = remoting(&broker, Duration::from_secs(5)).await;
    for i in 0..4i64 {
        let sum: i64 = caller
            .proxy("ICalculator")
            .invoke("Add", (i, 1i64))
            .await
            .unwrap();
        assert_eq!(sum, i + 1);
    }

    bystander.stop().await.unwrap();
    owner.stop().await.unwrap();
}

#[tokio::test]
async fn test_unacked_request_is_redelivered_after_disconnect() {
    let broker = start_broker().await;
    let caller = remoting(&broker, Duration::from_secs(5)).await;

    // A consumer that takes the request and vanishes without acknowledging.
    let mut flaky = TcpStream::connect(broker.addr()).await.unwrap();
    let consume = encode_frame(&ClientFrame::Consume {
        queue: "courier.requests".to_string(),
        prefetch: 1,
        exclusive: false,
    })
    .unwrap();
    write_frame(&mut flaky, &consume).await.unwrap();
    wait_for_consumers(&broker, "courier.requests", 1).await;

    let call = {
        let proxy = caller.proxy("ICalculator");
        tokio::spawn(async move { proxy.invoke::<_, i64>("Add", (20i64, 22i64)).await })
    };

    let frame = read_frame(&mut flaky).await.unwrap().unwrap();
    assert!(matches!(
        decode_frame::<ServerFrame>(&frame).unwrap(),
        ServerFrame::Deliver { .. }
    ));
    drop(flaky);

    let receiver = remoting(&broker, Duration::from_secs(5)).await;
    let serving = receiver.serve(calculator_registry());

    assert_eq!(call.await.unwrap().unwrap(), 42);
    serving.stop().await.unwrap();
}

#[tokio::test]
async fn test_stopped_receiver_leaves_requests_queued() {
    let broker = start_broker().await;
    let receiver = remoting(&broker, Duration::from_secs(5)).await;
    let serving = receiver.serve(calculator_registry());
    wait_for_consumers(&broker, "courier.requests", 1).await;
    serving.stop().await.unwrap();
    wait_for_consumers_gone(&broker).await;

    let caller = remoting(&broker, Duration::from_millis(200)).await;
    let err = caller
        .proxy("ICalculator")
        .invoke::<_, i64>("Add", (1i64, 1i64))
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::Timeout(_)));
    assert_eq!(broker.queue_depth("courier.requests"), 1);

    // Disposing the caller does not affect the queued request.
    caller.transport().dispose().await.unwrap();
    assert_eq!(broker.queue_depth("courier.requests"), 1);
}

#[tokio::test]
async fn test_reply_queue_is_removed_with_its_caller() {
    struct Slow;
    let broker = start_broker().await;
    let serving = remoting(&broker, Duration::from_secs(5)).await.serve(
        ServiceRegistry::builder()
            .register(
                ServiceDescriptor::shared("ISlow", Arc::new(Slow))
                    .async_method("Nap", |_: Arc<Slow>, (): ()| async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok::<_, std::convert::Infallible>(7i32)
                    })
                    .build(),
            )
            .build(),
    );
    wait_for_consumers(&broker, "courier.requests", 1).await;

    let transport = BrokerTransport::connect(BrokerOptions::new(broker.addr()))
        .await
        .unwrap();
    let reply_queue = transport.reply_queue().to_string();
    let caller = Remoting::builder()
        .transport(transport)
        .timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    wait_for_consumers(&broker, &reply_queue, 1).await;

    let err = caller
        .proxy("ISlow")
        .invoke::<_, i32>("Nap", ())
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::Timeout(_)));

    caller.transport().dispose().await.unwrap();
    for _ in 0..100 {
        if !broker.has_queue(&reply_queue) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!broker.has_queue(&reply_queue));

    // The late reply is published after the caller left and must not
    // bring the queue back.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!broker.has_queue(&reply_queue));
    assert_eq!(broker.queue_depth(&reply_queue), 0);

    serving.stop().await.unwrap();
}

async fn wait_for_consumers_gone(broker: &BrokerHandle) {
    for _ in 0..100 {
        if broker.consumer_count("courier.requests") == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Expected consumers on courier.requests to be removed");
}
