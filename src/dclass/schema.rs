//! The built-in game schema.
//!
//! Three classes cover the cluster's own flows: `Account` (database only),
//! `Avatar` (the player object, generated into the state server on
//! activation), and `District` (the per-shard presence object an AI
//! publishes). Operators with a richer world supply their own catalog via
//! the `[schema]` config section.

use super::{ArgKind, Catalog, ClassSpec, FieldSpec, FieldValue};

pub const CLASS_ACCOUNT: u16 = 1;
pub const CLASS_AVATAR: u16 = 2;
pub const CLASS_DISTRICT: u16 = 3;

fn field(number: u16, name: &str, args: &[ArgKind]) -> FieldSpec {
    FieldSpec {
        number,
        name: name.to_string(),
        args: args.to_vec(),
        required: false,
        broadcast: false,
        ram: false,
        db: false,
        clsend: false,
        ownsend: false,
        airecv: false,
        default: None,
    }
}

fn account_class() -> ClassSpec {
    let mut fields = Vec::new();

    let mut av_set = field(10, "ACCOUNT_AV_SET", &[ArgKind::U32Array]);
    av_set.required = true;
    av_set.db = true;
    av_set.default = Some(vec![FieldValue::U32Array(vec![0; 6])]);
    fields.push(av_set);

    for (number, name) in [
        (11, "BIRTH_DATE"),
        (12, "BLAST_NAME"),
        (13, "CREATED"),
        (14, "FIRST_NAME"),
        (15, "LAST_LOGIN"),
        (16, "LAST_NAME"),
        (17, "PLAYED_MINUTES"),
        (18, "PLAYED_MINUTES_PERIOD"),
    ] {
        let mut f = field(number, name, &[ArgKind::Str]);
        f.db = true;
        f.default = Some(vec![FieldValue::Str(String::new())]);
        fields.push(f);
    }

    let mut houses = field(19, "HOUSE_ID_SET", &[ArgKind::U32Array]);
    houses.db = true;
    houses.default = Some(vec![FieldValue::U32Array(vec![0; 6])]);
    fields.push(houses);

    let mut estate = field(20, "ESTATE_ID", &[ArgKind::U32]);
    estate.db = true;
    estate.default = Some(vec![FieldValue::U32(0)]);
    fields.push(estate);

    ClassSpec {
        number: CLASS_ACCOUNT,
        name: "Account".to_string(),
        player_avatar: false,
        fields,
    }
}

fn avatar_class() -> ClassSpec {
    let mut fields = Vec::new();

    let mut name = field(100, "setName", &[ArgKind::Str]);
    name.required = true;
    name.broadcast = true;
    name.ram = true;
    name.db = true;
    fields.push(name);

    let mut dna = field(101, "setDNAString", &[ArgKind::Str]);
    dna.required = true;
    dna.broadcast = true;
    dna.ram = true;
    dna.db = true;
    fields.push(dna);

    let mut pos = field(102, "setPosIndex", &[ArgKind::U8]);
    pos.required = true;
    pos.ram = true;
    pos.db = true;
    fields.push(pos);

    let mut chat_flags = field(110, "setCommonChatFlags", &[ArgKind::U8]);
    chat_flags.ram = true;
    chat_flags.db = true;
    chat_flags.broadcast = true;
    chat_flags.default = Some(vec![FieldValue::U8(0)]);
    fields.push(chat_flags);

    let mut trophy = field(111, "setTrophyScore", &[ArgKind::U16]);
    trophy.ram = true;
    trophy.db = true;
    trophy.default = Some(vec![FieldValue::U16(0)]);
    fields.push(trophy);

    let mut friends = field(112, "setFriendsList", &[ArgKind::PairArray]);
    friends.db = true;
    friends.default = Some(vec![FieldValue::PairArray(Vec::new())]);
    fields.push(friends);

    // Live gameplay traffic; never persisted.
    let mut talk = field(120, "setTalk", &[ArgKind::Str]);
    talk.clsend = true;
    talk.broadcast = true;
    fields.push(talk);

    let mut anim = field(121, "setAnimState", &[ArgKind::Str]);
    anim.ownsend = true;
    anim.broadcast = true;
    anim.ram = true;
    fields.push(anim);

    let mut experience = field(122, "setExperience", &[ArgKind::U32]);
    experience.ram = true;
    experience.db = true;
    experience.airecv = true;
    fields.push(experience);

    ClassSpec {
        number: CLASS_AVATAR,
        name: "Avatar".to_string(),
        player_avatar: true,
        fields,
    }
}

fn district_class() -> ClassSpec {
    let mut fields = Vec::new();

    let mut name = field(30, "setName", &[ArgKind::Str]);
    name.required = true;
    name.broadcast = true;
    name.ram = true;
    fields.push(name);

    let mut available = field(31, "setAvailable", &[ArgKind::U8]);
    available.broadcast = true;
    available.ram = true;
    fields.push(available);

    ClassSpec {
        number: CLASS_DISTRICT,
        name: "District".to_string(),
        player_avatar: false,
        fields,
    }
}

/// The catalog otpd ships with.
pub fn game_schema() -> Catalog {
    Catalog::new(vec![account_class(), avatar_class(), district_class()])
        .expect("built-in schema is well-formed")
}
