//! Typed handles over engine objects.
//!
//! A handle is an id pair plus a [`Connection`]; every method is one call.

use serde_json::{json, Value};

use crate::connection::Connection;
use crate::error::Result;

#[derive(Clone)]
pub struct Account {
    connection: Connection,
    id: u64,
}

impl Account {
    pub fn new(connection: Connection, id: u64) -> Self {
        Self { connection, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn chat(&self, chat_id: u64) -> Chat {
        Chat::new(self.connection.clone(), self.id, chat_id)
    }

    pub fn contact(&self, contact_id: u64) -> Contact {
        Contact::new(self.connection.clone(), self.id, contact_id)
    }

    pub fn message(&self, message_id: u64) -> Message {
        Message::new(self.connection.clone(), self.id, message_id)
    }

    pub async fn get_info(&self) -> Result<Value> {
        self.connection
            .call("get_account_info", vec![json!(self.id)])
            .await
    }

    pub async fn start_io(&self) -> Result<()> {
        self.connection.call("start_io", vec![json!(self.id)]).await?;
        Ok(())
    }

    pub async fn stop_io(&self) -> Result<()> {
        self.connection.call("stop_io", vec![json!(self.id)]).await?;
        Ok(())
    }

    /// Creates a contact, or updates the name of an existing one.
    pub async fn create_contact(&self, address: &str, name: Option<&str>) -> Result<Contact> {
        let contact_id: u64 = self
            .connection
            .call_as(
                "create_contact",
                vec![json!(self.id), json!(address), json!(name)],
            )
            .await?;
        Ok(self.contact(contact_id))
    }
}

#[derive(Clone)]
pub struct Chat {
    connection: Connection,
    account_id: u64,
    id: u64,
}

impl Chat {
    pub fn new(connection: Connection, account_id: u64, id: u64) -> Self {
        Self {
            connection,
            account_id,
            id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn account_id(&self) -> u64 {
        self.account_id
    }

    fn ids(&self) -> Vec<Value> {
        vec![json!(self.account_id), json!(self.id)]
    }

    async fn call_unit(&self, method: &str) -> Result<()> {
        self.connection.call(method, self.ids()).await?;
        Ok(())
    }

    /// Block the chat. A blocked contact request no longer shows up.
    pub async fn block(&self) -> Result<()> {
        self.call_unit("block_chat").await
    }

    /// Accept a contact request.
    pub async fn accept(&self) -> Result<()> {
        self.call_unit("accept_chat").await
    }

    pub async fn delete(&self) -> Result<()> {
        self.call_unit("delete_chat").await
    }

    pub async fn get_encryption_info(&self) -> Result<String> {
        self.connection
            .call_as("get_chat_encryption_info", self.ids())
            .await
    }

    pub async fn send_text(&self, text: &str) -> Result<Message> {
        let mut params = self.ids();
        params.push(json!(text));
        let message_id: u64 = self
            .connection
            .call_as("misc_send_text_message", params)
            .await?;
        Ok(Message::new(self.connection.clone(), self.account_id, message_id))
    }

    /// Leave a group chat.
    pub async fn leave(&self) -> Result<()> {
        self.call_unit("leave_group").await
    }

    pub async fn get_fresh_message_count(&self) -> Result<u64> {
        self.connection.call_as("get_fresh_msg_cnt", self.ids()).await
    }
}

#[derive(Clone)]
pub struct Message {
    connection: Connection,
    account_id: u64,
    id: u64,
}

impl Message {
    pub fn new(connection: Connection, account_id: u64, id: u64) -> Self {
        Self {
            connection,
            account_id,
            id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn account_id(&self) -> u64 {
        self.account_id
    }

    pub async fn get_snapshot(&self) -> Result<Value> {
        self.connection
            .call("get_message", vec![json!(self.account_id), json!(self.id)])
            .await
    }

    pub async fn mark_seen(&self) -> Result<()> {
        self.connection
            .call(
                "markseen_msgs",
                vec![json!(self.account_id), json!([self.id])],
            )
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Contact {
    connection: Connection,
    account_id: u64,
    id: u64,
}

impl Contact {
    pub fn new(connection: Connection, account_id: u64, id: u64) -> Self {
        Self {
            connection,
            account_id,
            id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn ids(&self) -> Vec<Value> {
        vec![json!(self.account_id), json!(self.id)]
    }

    pub async fn get_snapshot(&self) -> Result<Value> {
        self.connection.call("get_contact", self.ids()).await
    }

    pub async fn block(&self) -> Result<()> {
        self.connection.call("block_contact", self.ids()).await?;
        Ok(())
    }

    pub async fn unblock(&self) -> Result<()> {
        self.connection.call("unblock_contact", self.ids()).await?;
        Ok(())
    }

    /// Opens (or finds) the one-to-one chat with this contact.
    pub async fn create_chat(&self) -> Result<Chat> {
        let chat_id: u64 = self
            .connection
            .call_as("create_chat_by_contact_id", self.ids())
            .await?;
        Ok(Chat::new(self.connection.clone(), self.account_id, chat_id))
    }
}
