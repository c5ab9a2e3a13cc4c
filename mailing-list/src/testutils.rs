use crate::directory::{DirectoryError, ListDirectory, Message, RemoteList};
use crate::types::{ListAddress, Subscriber};
use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    FetchList,
    CreateList,
    RenameList,
    DeleteList,
    AddMember,
    UpdateMember,
    RemoveMember,
    SendMessage,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    FetchList(ListAddress),
    CreateList {
        address: ListAddress,
        name: String,
    },
    RenameList {
        address: ListAddress,
        name: String,
    },
    DeleteList(ListAddress),
    AddMember {
        address: ListAddress,
        member: Subscriber,
        unsubscribe_url: String,
    },
    UpdateMember {
        address: ListAddress,
        old_email: String,
        member: Subscriber,
    },
    RemoveMember {
        address: ListAddress,
        email: String,
    },
    SendMessage(Message),
}

impl Call {
    fn operation(&self) -> Operation {
        match self {
            Call::FetchList(_) => Operation::FetchList,
            Call::CreateList { .. } => Operation::CreateList,
            Call::RenameList { .. } => Operation::RenameList,
            Call::DeleteList(_) => Operation::DeleteList,
            Call::AddMember { .. } => Operation::AddMember,
            Call::UpdateMember { .. } => Operation::UpdateMember,
            Call::RemoveMember { .. } => Operation::RemoveMember,
            Call::SendMessage(_) => Operation::SendMessage,
        }
    }
}

struct Failure {
    operation: Operation,
    // Matching calls that still succeed before the failure triggers
    skip: usize,
    status: StatusCode,
}

struct StoredList {
    name: String,
    // Keyed by email, like the provider
    members: HashMap<String, Subscriber>,
}

#[derive(Default)]
struct State {
    lists: HashMap<ListAddress, StoredList>,
    calls: Vec<Call>,
    failures: Vec<Failure>,
}

/// In-memory list directory that mirrors the provider's keying rules and records
/// every call it receives.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<State>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_list(&self, address: &ListAddress, name: &str, members: &[Subscriber]) {
        let members = members
            .iter()
            .map(|m| (m.email.clone(), m.clone()))
            .collect();
        self.state.lock().lists.insert(
            address.clone(),
            StoredList {
                name: name.to_string(),
                members,
            },
        );
    }

    /// Adds a member without an id, as if added outside of this system.
    pub fn insert_foreign_member(&self, address: &ListAddress, email: &str) {
        let mut state = self.state.lock();
        let list = state.lists.get_mut(address).expect("list exists");
        list.members.insert(
            email.to_string(),
            Subscriber::new(email, email, "", true),
        );
    }

    pub fn list(&self, address: &ListAddress) -> Option<RemoteList> {
        self.state.lock().lists.get(address).map(to_remote)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Recorded calls that change remote state.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::FetchList(_)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// The next call of this operation fails with `status`.
    pub fn fail_next(&self, operation: Operation, status: StatusCode) {
        self.fail_after(operation, 0, status);
    }

    /// Lets `skip` calls of this operation succeed, then fails the next one with `status`.
    pub fn fail_after(&self, operation: Operation, skip: usize, status: StatusCode) {
        self.state.lock().failures.push(Failure {
            operation,
            skip,
            status,
        });
    }

    fn record(&self, state: &mut State, call: Call) -> Result<(), DirectoryError> {
        let operation = call.operation();
        state.calls.push(call);

        let Some(index) = state
            .failures
            .iter()
            .position(|f| f.operation == operation)
        else {
            return Ok(());
        };

        if state.failures[index].skip > 0 {
            state.failures[index].skip -= 1;
            return Ok(());
        }

        let failure = state.failures.remove(index);
        Err(DirectoryError::UnexpectedStatus {
            operation: operation_name(operation),
            status: failure.status,
        })
    }
}

fn operation_name(operation: Operation) -> &'static str {
    match operation {
        Operation::FetchList => "fetch_list",
        Operation::CreateList => "create_list",
        Operation::RenameList => "rename_list",
        Operation::DeleteList => "delete_list",
        Operation::AddMember => "add_member",
        Operation::UpdateMember => "update_member",
        Operation::RemoveMember => "remove_member",
        Operation::SendMessage => "send_message",
    }
}

// Members are listed in email order so that duplicate ids resolve predictably.
fn to_remote(list: &StoredList) -> RemoteList {
    let mut members: Vec<Subscriber> = list.members.values().cloned().collect();
    members.sort_by(|a, b| a.email.cmp(&b.email));
    RemoteList::from_members(list.name.clone(), members)
}

fn rejected(operation: &'static str, status: StatusCode) -> DirectoryError {
    DirectoryError::UnexpectedStatus { operation, status }
}

#[async_trait]
impl ListDirectory for InMemoryDirectory {
    async fn fetch_list(&self, address: &ListAddress) -> Result<Option<RemoteList>, DirectoryError> {
        let mut state = self.state.lock();
        self.record(&mut state, Call::FetchList(address.clone()))?;
        Ok(state.lists.get(address).map(to_remote))
    }

    async fn create_list(&self, address: &ListAddress, name: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        self.record(
            &mut state,
            Call::CreateList {
                address: address.clone(),
                name: name.to_string(),
            },
        )?;
        if state.lists.contains_key(address) {
            return Err(rejected("create_list", StatusCode::BAD_REQUEST));
        }
        state.lists.insert(
            address.clone(),
            StoredList {
                name: name.to_string(),
                members: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn rename_list(&self, address: &ListAddress, name: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        self.record(
            &mut state,
            Call::RenameList {
                address: address.clone(),
                name: name.to_string(),
            },
        )?;
        let list = state
            .lists
            .get_mut(address)
            .ok_or_else(|| rejected("rename_list", StatusCode::NOT_FOUND))?;
        list.name = name.to_string();
        Ok(())
    }

    async fn delete_list(&self, address: &ListAddress) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        self.record(&mut state, Call::DeleteList(address.clone()))?;
        state
            .lists
            .remove(address)
            .map(|_| ())
            .ok_or_else(|| rejected("delete_list", StatusCode::NOT_FOUND))
    }

    async fn add_member(
        &self,
        address: &ListAddress,
        member: &Subscriber,
        unsubscribe_url: &str,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        self.record(
            &mut state,
            Call::AddMember {
                address: address.clone(),
                member: member.clone(),
                unsubscribe_url: unsubscribe_url.to_string(),
            },
        )?;
        let list = state
            .lists
            .get_mut(address)
            .ok_or_else(|| rejected("add_member", StatusCode::NOT_FOUND))?;
        if list.members.contains_key(&member.email) {
            return Err(rejected("add_member", StatusCode::BAD_REQUEST));
        }
        list.members.insert(member.email.clone(), member.clone());
        Ok(())
    }

    async fn update_member(
        &self,
        address: &ListAddress,
        old_email: &str,
        member: &Subscriber,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        self.record(
            &mut state,
            Call::UpdateMember {
                address: address.clone(),
                old_email: old_email.to_string(),
                member: member.clone(),
            },
        )?;
        let list = state
            .lists
            .get_mut(address)
            .ok_or_else(|| rejected("update_member", StatusCode::NOT_FOUND))?;
        if member.email != old_email && list.members.contains_key(&member.email) {
            return Err(rejected("update_member", StatusCode::BAD_REQUEST));
        }
        let mut existing = list
            .members
            .remove(old_email)
            .ok_or_else(|| rejected("update_member", StatusCode::NOT_FOUND))?;
        // The update form does not carry vars, so the stored id survives.
        existing.email = member.email.clone();
        existing.name = member.name.clone();
        existing.subscribed = member.subscribed;
        list.members.insert(existing.email.clone(), existing);
        Ok(())
    }

    async fn remove_member(&self, address: &ListAddress, email: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        self.record(
            &mut state,
            Call::RemoveMember {
                address: address.clone(),
                email: email.to_string(),
            },
        )?;
        let list = state
            .lists
            .get_mut(address)
            .ok_or_else(|| rejected("remove_member", StatusCode::NOT_FOUND))?;
        list.members
            .remove(email)
            .map(|_| ())
            .ok_or_else(|| rejected("remove_member", StatusCode::NOT_FOUND))
    }

    async fn send_message(&self, message: &Message) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        self.record(&mut state, Call::SendMessage(message.clone()))
    }
}
