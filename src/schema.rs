#![allow(clippy::all, missing_docs)]

table! {
    users (id) {
        id -> Integer,
        username -> Text,
        hashed_password -> Text,
        name -> Text,
        role -> Text,
        department -> Nullable<Text>,
        is_active -> Bool,
        tag_id -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    students (id) {
        id -> Integer,
        student_id -> Text,
        name -> Text,
        department -> Text,
        email -> Nullable<Text>,
        tag_id -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    clearance_records (id) {
        id -> Integer,
        student_id -> Text,
        department -> Text,
        status -> Text,
        remarks -> Nullable<Text>,
        cleared_by -> Nullable<Integer>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    devices (id) {
        id -> Integer,
        device_id -> Text,
        name -> Text,
        location -> Nullable<Text>,
        api_key -> Text,
        is_active -> Bool,
        last_seen -> Nullable<Timestamp>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    pending_tag_links (id) {
        id -> Integer,
        device_id -> Integer,
        target_kind -> Text,
        target_identifier -> Text,
        initiated_by -> Integer,
        expires_at -> Timestamp,
        created_at -> Timestamp,
    }
}

table! {
    device_logs (id) {
        id -> Integer,
        device_id -> Nullable<Integer>,
        tag_id -> Nullable<Text>,
        action -> Text,
        created_at -> Timestamp,
    }
}
