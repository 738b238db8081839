//! Client-side helpers shared by the loopback tests.

use std::io::{self, Read};

/// Reads one fixed-length response: the head as text and the body bytes.
pub(crate) fn read_response<R: Read>(stream: &mut R) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("response head");
        head.push(byte[0]);
    }

    let head = String::from_utf8(head).unwrap();
    let length = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .map(|value| value.trim().parse::<usize>().unwrap())
        .unwrap_or(0);

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).expect("response body");
    (head, body)
}

/// Asserts the peer has closed the connection.
pub(crate) fn assert_closed<R: Read>(stream: &mut R) {
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(_) => panic!("connection still delivering data"),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected close, got {}", e),
    }
}
