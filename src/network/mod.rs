pub mod conn_set;
pub mod connection;
pub mod endpoint;
pub mod filter;
pub mod mconnection;
pub mod node_info;
pub mod node_key;
pub mod packet;
pub mod secret_connection;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util {
    use crate::network::node_key::NodeKey;
    use crate::network::secret_connection::SecretConnection;
    use tokio::net::{TcpListener, TcpStream};

    pub async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    pub async fn secret_pair() -> (SecretConnection, SecretConnection) {
        let (client, server) = tcp_pair().await;
        let key_a = NodeKey::from_bytes(&[1u8; 32]);
        let key_b = NodeKey::from_bytes(&[2u8; 32]);
        let (a, b) = tokio::join!(
            SecretConnection::make(client, &key_a),
            SecretConnection::make(server, &key_b)
        );
        (a.unwrap(), b.unwrap())
    }
}
