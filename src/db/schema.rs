use rusqlite::Connection;

/// Initialize the database schema
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Courses (read-only projection of the catalog service)
        -- price_cents = 0 marks a free course
        CREATE TABLE IF NOT EXISTS courses (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            price_cents INTEGER NOT NULL CHECK (price_cents >= 0),
            currency TEXT NOT NULL,
            hotmart_url TEXT,
            kiwify_url TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Payment orders (one row per checkout attempt)
        -- version: optimistic concurrency counter, every write is a compare-and-set on it
        -- enrollment_pending: succeeded but the enrollment grant is not confirmed yet
        -- checkout_url / client_secret: the provider session, handed out again on resume
        CREATE TABLE IF NOT EXISTS payment_orders (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            course_id TEXT NOT NULL REFERENCES courses(id),
            gateway TEXT NOT NULL CHECK (gateway IN ('stripe', 'mercadopago', 'hotmart', 'kiwify')),
            external_reference TEXT,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'succeeded', 'failed', 'cancelled', 'expired')),
            version INTEGER NOT NULL DEFAULT 0,
            enrollment_pending INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            raw_last_event TEXT,
            checkout_url TEXT,
            client_secret TEXT
        );
        -- Webhooks and polls find orders by provider reference
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_orders_reference
            ON payment_orders(gateway, external_reference) WHERE external_reference IS NOT NULL;
        -- At most one in-flight checkout per (user, course)
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_orders_active
            ON payment_orders(user_id, course_id) WHERE status IN ('pending', 'processing');
        CREATE INDEX IF NOT EXISTS idx_payment_orders_user_course
            ON payment_orders(user_id, course_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_payment_orders_processing
            ON payment_orders(updated_at) WHERE status = 'processing';
        CREATE INDEX IF NOT EXISTS idx_payment_orders_enrollment_pending
            ON payment_orders(id) WHERE enrollment_pending = 1;

        -- Enrollments (created only by the enrollment granter)
        -- order_id is NULL for free courses
        CREATE TABLE IF NOT EXISTS enrollments (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            course_id TEXT NOT NULL REFERENCES courses(id),
            order_id TEXT REFERENCES payment_orders(id),
            enrolled_at INTEGER NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
            UNIQUE(user_id, course_id)
        );

        -- Webhook events (append-only audit of every delivery)
        -- Only processed and outcome are ever updated, once
        CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            gateway TEXT NOT NULL,
            external_reference TEXT,
            declared_status TEXT,
            dedup_key TEXT,
            received_at INTEGER NOT NULL,
            signature_valid INTEGER NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            outcome TEXT,
            payload TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_webhook_events_dedup
            ON webhook_events(dedup_key) WHERE processed = 1;
        CREATE INDEX IF NOT EXISTS idx_webhook_events_deferred
            ON webhook_events(received_at) WHERE processed = 0 AND signature_valid = 1;
        CREATE INDEX IF NOT EXISTS idx_webhook_events_reference
            ON webhook_events(gateway, external_reference);

        -- Tax ids captured before leaving for a redirect gateway (latest write wins)
        CREATE TABLE IF NOT EXISTS external_checkout_records (
            user_id TEXT NOT NULL,
            course_id TEXT NOT NULL REFERENCES courses(id),
            tax_id TEXT NOT NULL,
            captured_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, course_id)
        );
        "#,
    )?;
    Ok(())
}
