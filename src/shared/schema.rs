diesel::table! {
    companies (id) {
        id -> Int4,
        name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_categories (id) {
        id -> Int4,
        name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tickets (id) {
        id -> Int4,
        company_id -> Int4,
        title -> Varchar,
        description -> Nullable<Text>,
        status -> SmallInt,
        priority -> SmallInt,
        category_id -> Nullable<Int4>,
        assignee_id -> Nullable<Uuid>,
        first_response_at -> Nullable<Timestamptz>,
        resolved_at -> Nullable<Timestamptz>,
        closed_at -> Nullable<Timestamptz>,
        row_version -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_comments (id) {
        id -> Int4,
        ticket_id -> Int4,
        author_role -> SmallInt,
        author_id -> Nullable<Uuid>,
        body -> Text,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(tickets -> companies (company_id));
diesel::joinable!(tickets -> ticket_categories (category_id));
diesel::joinable!(ticket_comments -> tickets (ticket_id));

diesel::allow_tables_to_appear_in_same_query!(companies, ticket_categories, tickets, ticket_comments);
