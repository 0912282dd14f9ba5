// Kept in sync by hand with the CREATE TABLE statements in `session_messages`.

diesel::table! {
    conversations (id) {
        id -> Integer,
        session_name -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    messages (id) {
        id -> Integer,
        role -> Text,
        content -> Text,
        created_at -> Text,
        conversation_id -> Nullable<Integer>,
    }
}

diesel::joinable!(messages -> conversations (conversation_id));

diesel::allow_tables_to_appear_in_same_query!(conversations, messages,);
