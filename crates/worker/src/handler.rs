//! Request handlers

use relayq_proto::Payload;

/// Turns a request payload into its reply payload
pub trait RequestHandler: Send {
    fn handle(&mut self, payload: &[u8]) -> Payload;
}

impl<F> RequestHandler for F
where
    F: FnMut(&[u8]) -> Payload + Send,
{
    fn handle(&mut self, payload: &[u8]) -> Payload {
        self(payload)
    }
}

/// Greets whoever sent the request
///
/// A request of the form `"<sender> says: Hi!"` is answered with
/// `"<name> says: Hi '<sender>'!"`.
#[derive(Debug, Clone)]
pub struct Greeter {
    name: String,
}

impl Greeter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl RequestHandler for Greeter {
    fn handle(&mut self, payload: &[u8]) -> Payload {
        let text = String::from_utf8_lossy(payload);
        let sender = text.split_whitespace().next().unwrap_or("stranger");
        format!("{} says: Hi '{}'!", self.name, sender).into_bytes()
    }
}
