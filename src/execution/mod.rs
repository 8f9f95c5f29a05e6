pub mod forwarder;
