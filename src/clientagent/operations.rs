//! Login, avatar, name, and friend orchestrations.
//!
//! Each flow is a short request/response chain over the database,
//! encoded as an explicit state enum advanced by correlated responses.
//! Cancellation is external: a disconnect drops the whole operation with
//! the session, and post-remove replay covers the side effects that must
//! survive it. One operation runs per session at a time.

use std::collections::{BTreeMap, HashMap};

use otp_proto::{
    account_connection_channel, msgtypes, puppet_connection_channel, session_channel, Datagram,
};
use tracing::{debug, warn};

use crate::dclass::FieldValue;

use super::session::Session;

/// Grace delay between an avatar's generate and its ownership grant.
const ACTIVATION_GRACE: std::time::Duration = std::time::Duration::from_millis(200);

/// A database response routed into the running operation.
pub enum OpEvent {
    Created { ctx: u32, do_id: u32 },
    Record { ctx: u32, record: Option<DbRecord> },
}

impl OpEvent {
    fn ctx(&self) -> u32 {
        match self {
            Self::Created { ctx, .. } | Self::Record { ctx, .. } => *ctx,
        }
    }
}

/// A fully fetched object record.
pub struct DbRecord {
    pub class_number: u16,
    pub fields: HashMap<String, Vec<FieldValue>>,
}

impl DbRecord {
    fn str_field(&self, name: &str) -> Option<&str> {
        match self.fields.get(name)?.first()? {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn u8_field(&self, name: &str) -> Option<u8> {
        match self.fields.get(name)?.first()? {
            FieldValue::U8(v) => Some(*v),
            _ => None,
        }
    }

    fn u32_array_field(&self, name: &str) -> Option<Vec<u32>> {
        match self.fields.get(name)?.first()? {
            FieldValue::U32Array(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn pair_array_field(&self, name: &str) -> Option<Vec<(u32, u8)>> {
        match self.fields.get(name)?.first()? {
            FieldValue::PairArray(v) => Some(v.clone()),
            _ => None,
        }
    }
}

pub enum OpOutcome {
    Continue,
    Done,
}

pub enum Operation {
    LoadAccount(LoadAccount),
    RetrieveAvatars(RetrieveAvatars),
    CreateAvatar(CreateAvatar),
    LoadAvatar(LoadAvatar),
    DeleteAvatar(DeleteAvatar),
    SetName(SetName),
    SetNamePattern(SetNamePattern),
    GetAvatarDetails(GetAvatarDetails),
    LoadFriendsList(LoadFriendsList),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadAccount(_) => "load-account",
            Self::RetrieveAvatars(_) => "retrieve-avatars",
            Self::CreateAvatar(_) => "create-avatar",
            Self::LoadAvatar(_) => "load-avatar",
            Self::DeleteAvatar(_) => "delete-avatar",
            Self::SetName(_) => "set-name",
            Self::SetNamePattern(_) => "set-name-pattern",
            Self::GetAvatarDetails(_) => "get-avatar-details",
            Self::LoadFriendsList(_) => "load-friends-list",
        }
    }

    pub fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        match self {
            Self::LoadAccount(op) => op.advance(session, event),
            Self::RetrieveAvatars(op) => op.advance(session, event),
            Self::CreateAvatar(op) => op.advance(session, event),
            Self::LoadAvatar(op) => op.advance(session, event),
            Self::DeleteAvatar(op) => op.advance(session, event),
            Self::SetName(op) => op.advance(session, event),
            Self::SetNamePattern(op) => op.advance(session, event),
            Self::GetAvatarDetails(op) => op.advance(session, event),
            Self::LoadFriendsList(op) => op.advance(session, event),
        }
    }

    // Constructors issue the flow's first request; a `None` return means
    // the flow could not start and nothing is pending.

    pub fn load_account(session: &mut Session, token: String) -> Option<Self> {
        LoadAccount::begin(session, token).map(Self::LoadAccount)
    }

    pub fn retrieve_avatars(session: &mut Session, account_id: u32) -> Option<Self> {
        let ctx = session.db_query(account_id);
        Some(Self::RetrieveAvatars(RetrieveAvatars {
            state: AvatarSetState::Account { ctx },
            respond_with: msgtypes::CLIENT_GET_AVATARS_RESP,
        }))
    }

    pub fn create_avatar(
        session: &mut Session,
        echo: u16,
        account_id: u32,
        dna: String,
        index: u8,
    ) -> Option<Self> {
        if index >= 6 {
            warn!(index, "Avatar slot out of range");
            return None;
        }
        let ctx = session.db_create(
            "Avatar",
            &[
                ("setName", FieldValue::Str("Avatar".to_string())),
                ("setDNAString", FieldValue::Str(dna)),
                ("setPosIndex", FieldValue::U8(index)),
            ],
        )?;
        Some(Self::CreateAvatar(CreateAvatar {
            echo,
            account_id,
            index,
            state: CreateAvatarState::Creating { ctx },
        }))
    }

    pub fn load_avatar(session: &mut Session, account_id: u32, avatar_id: u32) -> Option<Self> {
        let ctx = session.db_query(avatar_id);
        Some(Self::LoadAvatar(LoadAvatar { account_id, avatar_id, ctx }))
    }

    pub fn delete_avatar(session: &mut Session, account_id: u32, avatar_id: u32) -> Option<Self> {
        let ctx = session.db_query(account_id);
        Some(Self::DeleteAvatar(DeleteAvatar {
            account_id,
            avatar_id,
            state: DeleteAvatarState::Account { ctx },
        }))
    }

    pub fn set_name(session: &mut Session, avatar_id: u32, wish_name: String) -> Option<Self> {
        let ctx = session.db_query(avatar_id);
        Some(Self::SetName(SetName { avatar_id, wish_name, ctx }))
    }

    pub fn set_name_pattern(
        session: &mut Session,
        avatar_id: u32,
        pattern: [(u16, u16); 4],
    ) -> Option<Self> {
        let ctx = session.db_query(avatar_id);
        Some(Self::SetNamePattern(SetNamePattern { avatar_id, pattern, ctx }))
    }

    pub fn get_avatar_details(session: &mut Session, avatar_id: u32) -> Option<Self> {
        let ctx = session.db_query(avatar_id);
        Some(Self::GetAvatarDetails(GetAvatarDetails { avatar_id, ctx }))
    }

    pub fn load_friends_list(session: &mut Session, avatar_id: u32) -> Option<Self> {
        if avatar_id == 0 {
            warn!("Friends list requested before avatar activation");
            return None;
        }
        let ctx = session.db_query(avatar_id);
        Some(Self::LoadFriendsList(LoadFriendsList {
            avatar_id,
            state: FriendsState::Avatar { ctx },
        }))
    }
}

fn stale(event: &OpEvent, expected: u32) -> bool {
    if event.ctx() != expected {
        debug!(ctx = event.ctx(), expected, "Stale database response");
        return true;
    }
    false
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

pub struct LoadAccount {
    token: String,
    state: LoadAccountState,
}

enum LoadAccountState {
    Query { ctx: u32, account_id: u32 },
    Create { ctx: u32 },
}

impl LoadAccount {
    fn begin(session: &mut Session, token: String) -> Option<Self> {
        let known = session.agent.tokens.lock().get(&token);
        let state = match known {
            Some(account_id) => {
                let ctx = session.db_query(account_id);
                LoadAccountState::Query { ctx, account_id }
            }
            None => {
                let ctx = session.db_create(
                    "Account",
                    &[
                        ("BLAST_NAME", FieldValue::Str(token.clone())),
                        ("CREATED", FieldValue::Str(chrono::Utc::now().to_rfc3339())),
                    ],
                )?;
                LoadAccountState::Create { ctx }
            }
        };
        Some(Self { token, state })
    }

    fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        match &self.state {
            LoadAccountState::Query { ctx, account_id } => {
                if stale(&event, *ctx) {
                    return OpOutcome::Continue;
                }
                match event {
                    OpEvent::Record { record: Some(_), .. } => {
                        self.finish(session, *account_id);
                        OpOutcome::Done
                    }
                    _ => {
                        warn!(account_id, token = %self.token, "Failed to load account");
                        OpOutcome::Done
                    }
                }
            }
            LoadAccountState::Create { ctx } => {
                if stale(&event, *ctx) {
                    return OpOutcome::Continue;
                }
                match event {
                    OpEvent::Created { do_id, .. } if do_id != 0 => {
                        session.agent.tokens.lock().set(&self.token, do_id);
                        self.finish(session, do_id);
                        OpOutcome::Done
                    }
                    _ => {
                        warn!(token = %self.token, "Failed to create account");
                        OpOutcome::Done
                    }
                }
            }
        }
    }

    /// The login succeeded: mark authenticated, take up the account
    /// channels, and answer the client.
    fn finish(&self, session: &mut Session, account_id: u32) {
        session.authenticated = true;
        session.bind_channel(account_connection_channel(account_id));
        session.set_channel(session_channel(account_id, 0));
        session.send_login_response(&self.token);
    }
}

// ---------------------------------------------------------------------------
// Avatar roster (shared by GetAvatars and DeleteAvatar responses)
// ---------------------------------------------------------------------------

fn send_avatar_roster(
    session: &mut Session,
    respond_with: u16,
    avatars: &BTreeMap<u32, DbRecord>,
) {
    let mut dg = Datagram::client_header(respond_with);
    dg.add_u8(0);
    dg.add_u16(avatars.len() as u16);
    for (do_id, record) in avatars {
        dg.add_u32(*do_id);
        dg.add_string(record.str_field("setName").unwrap_or_default());
        dg.add_string("");
        dg.add_string("");
        dg.add_string("");
        dg.add_string(record.str_field("setDNAString").unwrap_or_default());
        dg.add_u8(record.u8_field("setPosIndex").unwrap_or_default());
        dg.add_u8(0);
    }
    session.send_client(dg);
}

pub struct RetrieveAvatars {
    state: AvatarSetState,
    respond_with: u16,
}

enum AvatarSetState {
    Account { ctx: u32 },
    Avatars { pending: HashMap<u32, u32>, collected: BTreeMap<u32, DbRecord> },
}

impl RetrieveAvatars {
    fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        match &mut self.state {
            AvatarSetState::Account { ctx } => {
                if stale(&event, *ctx) {
                    return OpOutcome::Continue;
                }
                let OpEvent::Record { record: Some(record), .. } = event else {
                    warn!("Failed to load account for avatar roster");
                    return OpOutcome::Done;
                };
                let Some(av_set) = record.u32_array_field("ACCOUNT_AV_SET") else {
                    warn!("Account record missing avatar set");
                    return OpOutcome::Done;
                };

                let mut pending = HashMap::new();
                for avatar_id in av_set.into_iter().filter(|id| *id != 0) {
                    pending.insert(session.db_query(avatar_id), avatar_id);
                }
                if pending.is_empty() {
                    send_avatar_roster(session, self.respond_with, &BTreeMap::new());
                    return OpOutcome::Done;
                }
                self.state = AvatarSetState::Avatars { pending, collected: BTreeMap::new() };
                OpOutcome::Continue
            }
            AvatarSetState::Avatars { pending, collected } => {
                let OpEvent::Record { ctx, record } = event else {
                    return OpOutcome::Continue;
                };
                let Some(avatar_id) = pending.remove(&ctx) else {
                    return OpOutcome::Continue;
                };
                match record {
                    Some(record) => {
                        collected.insert(avatar_id, record);
                    }
                    None => warn!(avatar_id, "Missing avatar record, leaving it off the roster"),
                }
                if pending.is_empty() {
                    send_avatar_roster(session, self.respond_with, collected);
                    return OpOutcome::Done;
                }
                OpOutcome::Continue
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Avatar creation
// ---------------------------------------------------------------------------

pub struct CreateAvatar {
    echo: u16,
    account_id: u32,
    index: u8,
    state: CreateAvatarState,
}

enum CreateAvatarState {
    Creating { ctx: u32 },
    Account { ctx: u32, avatar_id: u32 },
}

impl CreateAvatar {
    fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        match &self.state {
            CreateAvatarState::Creating { ctx } => {
                if stale(&event, *ctx) {
                    return OpOutcome::Continue;
                }
                let OpEvent::Created { do_id, .. } = event else {
                    return OpOutcome::Continue;
                };
                if do_id == 0 {
                    warn!(account = self.account_id, "Avatar creation failed in the database");
                    return OpOutcome::Done;
                }
                let ctx = session.db_query(self.account_id);
                self.state = CreateAvatarState::Account { ctx, avatar_id: do_id };
                OpOutcome::Continue
            }
            CreateAvatarState::Account { ctx, avatar_id } => {
                if stale(&event, *ctx) {
                    return OpOutcome::Continue;
                }
                let OpEvent::Record { record: Some(record), .. } = event else {
                    warn!(account = self.account_id, "Failed to load account for new avatar");
                    return OpOutcome::Done;
                };
                let mut av_set =
                    record.u32_array_field("ACCOUNT_AV_SET").unwrap_or_else(|| vec![0; 6]);
                if av_set.len() < 6 {
                    av_set.resize(6, 0);
                }
                av_set[self.index as usize] = *avatar_id;
                session.db_set_field(
                    self.account_id,
                    "Account",
                    "ACCOUNT_AV_SET",
                    FieldValue::U32Array(av_set),
                );

                let mut dg = Datagram::client_header(msgtypes::CLIENT_CREATE_AVATAR_RESP);
                dg.add_u16(self.echo);
                dg.add_u8(0);
                dg.add_u32(*avatar_id);
                session.send_client(dg);
                OpOutcome::Done
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Avatar activation
// ---------------------------------------------------------------------------

pub struct LoadAvatar {
    account_id: u32,
    avatar_id: u32,
    ctx: u32,
}

impl LoadAvatar {
    fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        if stale(&event, self.ctx) {
            return OpOutcome::Continue;
        }
        let OpEvent::Record { record: Some(record), .. } = event else {
            warn!(avatar = self.avatar_id, "Failed to load avatar for activation");
            return OpOutcome::Done;
        };

        let catalog = session.agent.catalog.clone();
        let Some(class) = catalog.class(record.class_number) else {
            warn!(class = record.class_number, "Avatar record has unknown class");
            return OpOutcome::Done;
        };

        // Take up the puppet channel and the avatar session identity
        // before the generate, so entries route back to this session.
        session.bind_channel(puppet_connection_channel(self.avatar_id));
        session.set_channel(session_channel(self.account_id, self.avatar_id));

        let mut dg = Datagram::server_header(
            otp_proto::STATE_SERVER_CHANNEL,
            session.channel,
            msgtypes::STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER,
        );
        dg.add_u32(self.avatar_id);
        dg.add_u32(0);
        dg.add_u32(0);
        dg.add_u16(class.number);

        for field in class.required_fields() {
            let Some(values) = record.fields.get(&field.name) else {
                warn!(avatar = self.avatar_id, field = %field.name, "Avatar record missing required field");
                return OpOutcome::Done;
            };
            match field.pack(values) {
                Ok(packed) => dg.add_raw(&packed),
                Err(e) => {
                    warn!(field = %field.name, error = %e, "Avatar field failed to pack");
                    return OpOutcome::Done;
                }
            }
        }

        // Selected non-required ram state rides the other block.
        let mut others = Vec::new();
        for name in ["setCommonChatFlags", "setTrophyScore"] {
            let Some(field) = class.field_by_name(name) else { continue };
            let values = record
                .fields
                .get(name)
                .cloned()
                .or_else(|| field.default.clone());
            if let Some(values) = values {
                if let Ok(packed) = field.pack(&values) {
                    others.push((field.number, packed));
                }
            }
        }
        dg.add_u16(others.len() as u16);
        for (number, packed) in others {
            dg.add_u16(number);
            dg.add_raw(&packed);
        }
        session.send_internal(dg);

        session.schedule_owner_grant(self.avatar_id, ACTIVATION_GRACE);
        OpOutcome::Done
    }
}

// ---------------------------------------------------------------------------
// Avatar deletion
// ---------------------------------------------------------------------------

pub struct DeleteAvatar {
    account_id: u32,
    avatar_id: u32,
    state: DeleteAvatarState,
}

enum DeleteAvatarState {
    Account { ctx: u32 },
    Roster(RetrieveAvatars),
}

impl DeleteAvatar {
    fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        match &mut self.state {
            DeleteAvatarState::Account { ctx } => {
                if stale(&event, *ctx) {
                    return OpOutcome::Continue;
                }
                let OpEvent::Record { record: Some(record), .. } = event else {
                    warn!(account = self.account_id, "Failed to load account for deletion");
                    return OpOutcome::Done;
                };
                let Some(mut av_set) = record.u32_array_field("ACCOUNT_AV_SET") else {
                    warn!("Account record missing avatar set");
                    return OpOutcome::Done;
                };

                let Some(slot) = av_set.iter().position(|id| *id == self.avatar_id) else {
                    warn!(avatar = self.avatar_id, "Deletion of an avatar the account does not hold");
                    return OpOutcome::Done;
                };
                av_set[slot] = 0;
                session.db_set_field(
                    self.account_id,
                    "Account",
                    "ACCOUNT_AV_SET",
                    FieldValue::U32Array(av_set.clone()),
                );

                // Answer with the surviving roster.
                let mut pending = HashMap::new();
                for avatar_id in av_set.into_iter().filter(|id| *id != 0) {
                    pending.insert(session.db_query(avatar_id), avatar_id);
                }
                if pending.is_empty() {
                    send_avatar_roster(
                        session,
                        msgtypes::CLIENT_DELETE_AVATAR_RESP,
                        &BTreeMap::new(),
                    );
                    return OpOutcome::Done;
                }
                self.state = DeleteAvatarState::Roster(RetrieveAvatars {
                    state: AvatarSetState::Avatars { pending, collected: BTreeMap::new() },
                    respond_with: msgtypes::CLIENT_DELETE_AVATAR_RESP,
                });
                OpOutcome::Continue
            }
            DeleteAvatarState::Roster(roster) => roster.advance(session, event),
        }
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

pub struct SetName {
    avatar_id: u32,
    wish_name: String,
    ctx: u32,
}

impl SetName {
    fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        if stale(&event, self.ctx) {
            return OpOutcome::Continue;
        }
        let OpEvent::Record { record: Some(_), .. } = event else {
            warn!(avatar = self.avatar_id, "Failed to load avatar for naming");
            return OpOutcome::Done;
        };

        session.db_set_field(
            self.avatar_id,
            "Avatar",
            "setName",
            FieldValue::Str(self.wish_name.clone()),
        );

        let mut dg = Datagram::client_header(msgtypes::CLIENT_SET_WISHNAME_RESP);
        dg.add_u32(self.avatar_id);
        dg.add_u16(0);
        dg.add_string("");
        dg.add_string(&self.wish_name);
        dg.add_string("");
        session.send_client(dg);
        OpOutcome::Done
    }
}

pub struct SetNamePattern {
    avatar_id: u32,
    pattern: [(u16, u16); 4],
    ctx: u32,
}

impl SetNamePattern {
    fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        if stale(&event, self.ctx) {
            return OpOutcome::Continue;
        }
        let OpEvent::Record { record: Some(_), .. } = event else {
            warn!(avatar = self.avatar_id, "Failed to load avatar for pattern naming");
            return OpOutcome::Done;
        };

        let name = session.agent.names.compose(&self.pattern);
        session.db_set_field(self.avatar_id, "Avatar", "setName", FieldValue::Str(name));

        let mut dg = Datagram::client_header(msgtypes::CLIENT_SET_NAME_PATTERN_ANSWER);
        dg.add_u32(self.avatar_id);
        dg.add_u8(0);
        session.send_client(dg);
        OpOutcome::Done
    }
}

// ---------------------------------------------------------------------------
// Avatar details
// ---------------------------------------------------------------------------

pub struct GetAvatarDetails {
    avatar_id: u32,
    ctx: u32,
}

impl GetAvatarDetails {
    fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        if stale(&event, self.ctx) {
            return OpOutcome::Continue;
        }
        let OpEvent::Record { record: Some(record), .. } = event else {
            warn!(avatar = self.avatar_id, "Failed to load avatar details");
            return OpOutcome::Done;
        };

        let catalog = session.agent.catalog.clone();
        let Some(class) = catalog.class(record.class_number) else {
            warn!(class = record.class_number, "Avatar record has unknown class");
            return OpOutcome::Done;
        };

        // Pack every stored field in field-number order.
        let mut packed = Datagram::new();
        for field in &class.fields {
            let Some(values) = record.fields.get(&field.name) else { continue };
            match field.pack(values) {
                Ok(bytes) => packed.add_raw(&bytes),
                Err(e) => {
                    warn!(field = %field.name, error = %e, "Detail field failed to pack");
                    return OpOutcome::Done;
                }
            }
        }

        let mut dg = Datagram::client_header(msgtypes::CLIENT_GET_AVATAR_DETAILS_RESP);
        dg.add_u32(self.avatar_id);
        dg.add_u8(0);
        dg.add_raw(packed.as_bytes());
        session.send_client(dg);
        OpOutcome::Done
    }
}

// ---------------------------------------------------------------------------
// Friends
// ---------------------------------------------------------------------------

pub struct LoadFriendsList {
    avatar_id: u32,
    state: FriendsState,
}

enum FriendsState {
    Avatar { ctx: u32 },
    Friends { pending: HashMap<u32, u32>, collected: BTreeMap<u32, DbRecord> },
}

impl LoadFriendsList {
    fn advance(&mut self, session: &mut Session, event: OpEvent) -> OpOutcome {
        match &mut self.state {
            FriendsState::Avatar { ctx } => {
                if stale(&event, *ctx) {
                    return OpOutcome::Continue;
                }
                let OpEvent::Record { record: Some(record), .. } = event else {
                    warn!(avatar = self.avatar_id, "Failed to load avatar for friends list");
                    return OpOutcome::Done;
                };
                let friends = record.pair_array_field("setFriendsList").unwrap_or_default();
                if friends.is_empty() {
                    self.respond(session, &BTreeMap::new());
                    return OpOutcome::Done;
                }

                let mut pending = HashMap::new();
                for (friend_id, _kind) in friends {
                    pending.insert(session.db_query(friend_id), friend_id);
                }
                self.state = FriendsState::Friends { pending, collected: BTreeMap::new() };
                OpOutcome::Continue
            }
            FriendsState::Friends { pending, collected } => {
                let OpEvent::Record { ctx, record } = event else {
                    return OpOutcome::Continue;
                };
                let Some(friend_id) = pending.remove(&ctx) else {
                    return OpOutcome::Continue;
                };
                if let Some(record) = record {
                    collected.insert(friend_id, record);
                }
                if pending.is_empty() {
                    let collected = std::mem::take(collected);
                    self.respond(session, &collected);
                    return OpOutcome::Done;
                }
                OpOutcome::Continue
            }
        }
    }

    fn respond(&self, session: &mut Session, friends: &BTreeMap<u32, DbRecord>) {
        let own_puppet = puppet_connection_channel(self.avatar_id);

        for friend_id in friends.keys() {
            let friend_puppet = puppet_connection_channel(*friend_id);
            let online = session.agent.is_online(friend_puppet);

            // Tell our client about them...
            let msg_type = if online {
                msgtypes::CLIENT_FRIEND_ONLINE
            } else {
                msgtypes::CLIENT_FRIEND_OFFLINE
            };
            let mut dg = Datagram::client_header(msg_type);
            dg.add_u32(*friend_id);
            session.send_client(dg);

            // ...tell them about us while we are here...
            if online {
                let mut dg = Datagram::server_header(
                    friend_puppet,
                    own_puppet,
                    msgtypes::CLIENTAGENT_FRIEND_ONLINE,
                );
                dg.add_u32(self.avatar_id);
                session.send_internal(dg);
            }

            // ...and make sure they hear about us leaving even if this
            // process never gets to say goodbye.
            let mut offline = Datagram::server_header(
                friend_puppet,
                own_puppet,
                msgtypes::CLIENTAGENT_FRIEND_OFFLINE,
            );
            offline.add_u32(self.avatar_id);
            session.agent.link.add_post_remove(session.allocated, &offline);
        }

        let mut dg = Datagram::client_header(msgtypes::CLIENT_GET_FRIEND_LIST_RESP);
        dg.add_u8(0);
        dg.add_u16(friends.len() as u16);
        for (friend_id, record) in friends {
            dg.add_u32(*friend_id);
            dg.add_string(record.str_field("setName").unwrap_or_default());
            dg.add_string(record.str_field("setDNAString").unwrap_or_default());
        }
        session.send_client(dg);
    }
}
