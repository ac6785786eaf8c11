pub mod arq_receiver;
pub mod arq_sender;
pub mod next_datagram;
pub mod packet;
pub mod sequence;
