use std::{io::ErrorKind, net::SocketAddr, time::Duration};

use futures_util::StreamExt;
use indi_protocol::{Message, codec::IndiCodec};
use indi_server::{
    driver::DriverSpec,
    server::{Builder, Server},
};
use indi_tests::{FakeDriver, TIMEOUT, eventually, read_len, read_until};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tokio_util::codec::FramedRead;

const CCD_EXPOSURE: &str = concat!(
    "<setNumberVector device=\"CCD Simulator\" name=\"CCD_EXPOSURE\" state=\"Busy\">\n",
    "  <oneNumber name=\"CCD_EXPOSURE_VALUE\">0.5</oneNumber>\n",
    "</setNumberVector>\n"
);

const MOUNT_COORD: &str = concat!(
    "<setNumberVector device=\"Telescope Simulator\" name=\"EQUATORIAL_EOD_COORD\" state=\"Ok\">",
    "<oneNumber name=\"RA\">5.5</oneNumber><oneNumber name=\"DEC\">-12</oneNumber>",
    "</setNumberVector>"
);

struct Relay {
    server: Server,
    addr: SocketAddr,
    camera_name: String,
    camera: TcpStream,
    mount: TcpStream,
}

/// Starts a relay for two fake drivers.
async fn relay_with_two_drivers() -> Relay {
    let camera = FakeDriver::bind().await;
    let mount = FakeDriver::bind().await;
    let server = Builder::new()
        .bind("127.0.0.1:0")
        .driver(camera.spec())
        .driver(mount.spec())
        .build();
    let addr = server.start().await.unwrap();
    assert_eq!(server.drivers().len(), 2);
    Relay {
        server,
        addr,
        camera_name: camera.spec().name(),
        camera: camera.accept().await,
        mount: mount.accept().await,
    }
}

async fn connect_clients(server: &Server, addr: SocketAddr, n: usize) -> Vec<TcpStream> {
    let mut clients = Vec::new();
    for _ in 0..n {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    eventually(|| server.client_count() == n).await;
    clients
}

#[tokio::test]
async fn driver_output_reaches_every_client() {
    let Relay {
        server,
        addr,
        mut camera,
        mut mount,
        ..
    } = relay_with_two_drivers().await;
    let mut clients = connect_clients(&server, addr, 3).await;

    camera.write_all(CCD_EXPOSURE.as_bytes()).await.unwrap();
    mount.write_all(MOUNT_COORD.as_bytes()).await.unwrap();

    for client in &mut clients {
        let received = read_len(client, CCD_EXPOSURE.len() + MOUNT_COORD.len()).await;
        let received = String::from_utf8(received).unwrap();
        assert!(received.contains(CCD_EXPOSURE));
        assert!(received.contains(MOUNT_COORD));
    }
    server.stop();
}

#[tokio::test]
async fn client_input_reaches_every_driver() {
    let Relay {
        server,
        addr,
        mut camera,
        mut mount,
        ..
    } = relay_with_two_drivers().await;
    let mut clients = connect_clients(&server, addr, 2).await;

    let query = b"<getProperties version=\"1.7\"/>\n";
    clients[0].write_all(query).await.unwrap();
    assert_eq!(read_len(&mut camera, query.len()).await, query);
    assert_eq!(read_len(&mut mount, query.len()).await, query);

    let command = "<newSwitchVector device=\"Telescope Simulator\" name=\"TELESCOPE_PARK\">\
                   <oneSwitch name=\"PARK\">On</oneSwitch></newSwitchVector>";
    clients[1].write_all(command.as_bytes()).await.unwrap();
    assert_eq!(read_len(&mut camera, command.len()).await, command.as_bytes());
    assert_eq!(read_len(&mut mount, command.len()).await, command.as_bytes());
    server.stop();
}

#[tokio::test]
async fn drivers_never_interleave_inside_a_message() {
    let Relay {
        server,
        addr,
        mut camera,
        mut mount,
        ..
    } = relay_with_two_drivers().await;
    let mut clients = connect_clients(&server, addr, 1).await;

    let (head, tail) = CCD_EXPOSURE.split_at(40);
    camera.write_all(head.as_bytes()).await.unwrap();
    camera.flush().await.unwrap();
    time::sleep(Duration::from_millis(50)).await;
    mount.write_all(MOUNT_COORD.as_bytes()).await.unwrap();
    let first = read_len(&mut clients[0], MOUNT_COORD.len()).await;
    assert_eq!(first, MOUNT_COORD.as_bytes());

    camera.write_all(tail.as_bytes()).await.unwrap();
    let second = read_len(&mut clients[0], CCD_EXPOSURE.len()).await;
    assert_eq!(second, CCD_EXPOSURE.as_bytes());
    server.stop();
}

#[tokio::test]
async fn relayed_stream_decodes() {
    let Relay {
        server,
        addr,
        mut camera,
        ..
    } = relay_with_two_drivers().await;
    let client = connect_clients(&server, addr, 1).await.remove(0);

    // A large BLOB arrives in many TCP segments.
    let payload = vec![0xa5u8; 256 * 1024];
    let message = Message::Set(
        indi_protocol::BlobVector::new("CCD Simulator", "CCD1")
            .with_member(indi_protocol::Blob::new("CCD1", "Image", ".fits", payload.clone()))
            .into(),
    );
    camera.write_all(message.to_xml().as_bytes()).await.unwrap();
    camera.write_all(CCD_EXPOSURE.as_bytes()).await.unwrap();

    let mut frames = FramedRead::new(client, IndiCodec::new());
    let first = time::timeout(TIMEOUT, frames.next()).await.unwrap().unwrap().unwrap();
    let Message::Set(property) = first else {
        panic!("expected a set message, got {first:?}");
    };
    assert_eq!(property.as_blob().unwrap().members[0].value, payload);
    let second = time::timeout(TIMEOUT, frames.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(second.device(), Some("CCD Simulator"));
    server.stop();
}

#[tokio::test]
async fn drivers_can_be_added_and_removed() {
    let Relay {
        server,
        addr,
        camera_name,
        mut camera,
        ..
    } = relay_with_two_drivers().await;
    let mut clients = connect_clients(&server, addr, 1).await;

    let focuser = FakeDriver::bind().await;
    let name = server.add_driver(focuser.spec()).await.unwrap();
    let mut focuser_socket = focuser.accept().await;
    assert!(server.driver(&name).is_some());

    let duplicate = server.add_driver(focuser.spec()).await.unwrap_err();
    assert_eq!(duplicate.kind(), ErrorKind::AlreadyExists);

    focuser_socket
        .write_all(b"<message device=\"Focuser\" message=\"ready\"/>")
        .await
        .unwrap();
    read_until(&mut clients[0], "ready", 1).await;

    assert!(server.remove_driver(&camera_name));
    assert!(!server.remove_driver(&camera_name));
    let mut buf = [0u8; 16];
    let read = time::timeout(TIMEOUT, camera.read(&mut buf)).await.unwrap();
    assert_eq!(read.unwrap(), 0, "removed driver is still connected");
    server.stop();
}

#[tokio::test]
async fn closed_drivers_leave_the_relay() {
    let fake = FakeDriver::bind().await;
    let server = Builder::new()
        .bind("127.0.0.1:0")
        .driver(fake.spec())
        .build();
    let addr = server.start().await.unwrap();
    let mut driver = fake.accept().await;
    let mut clients = connect_clients(&server, addr, 1).await;

    driver.write_all(MOUNT_COORD.as_bytes()).await.unwrap();
    drop(driver);
    assert_eq!(read_len(&mut clients[0], MOUNT_COORD.len()).await, MOUNT_COORD.as_bytes());
    eventually(|| server.drivers().is_empty()).await;

    let name = server.add_driver(fake.spec()).await.unwrap();
    let mut driver = fake.accept().await;
    assert_eq!(server.drivers(), vec![name]);
    clients[0].write_all(b"<getProperties version=\"1.7\"/>").await.unwrap();
    read_until(&mut driver, "getProperties", 1).await;
    server.stop();
}

#[tokio::test]
async fn unreachable_drivers_are_skipped() {
    let unused = FakeDriver::bind().await;
    let spec = unused.spec();
    drop(unused);
    let server = Builder::new().bind("127.0.0.1:0").driver(spec).build();
    server.start().await.unwrap();
    assert!(server.is_active());
    assert!(server.drivers().is_empty());
    assert!(
        server
            .add_driver(DriverSpec::process("/nonexistent/indi_driver"))
            .await
            .is_err()
    );
    server.stop();
}

#[tokio::test]
async fn stop_closes_clients() {
    let Relay { server, addr, .. } = relay_with_two_drivers().await;
    let mut clients = connect_clients(&server, addr, 1).await;
    assert!(server.is_active());

    server.stop();
    assert!(!server.is_active());
    assert!(server.drivers().is_empty());
    let mut buf = [0u8; 16];
    let read = time::timeout(TIMEOUT, clients[0].read(&mut buf)).await.unwrap();
    assert_eq!(read.unwrap(), 0);
    assert_eq!(server.client_count(), 0);
}
